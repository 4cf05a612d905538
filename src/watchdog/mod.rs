//! Background sweeper driving time-based status transitions.
//!
//! One pass per tick over every known agent; per-agent failures are
//! logged and never abort the sweep. Each agent is evaluated under its
//! shard lock, so a sweep never interleaves with an in-flight `track`
//! for the same agent.

use crate::config::WatchdogConfig;
use crate::service::locks::AgentLocks;
use crate::status::StatusEngine;
use crate::storage::StorageDriver;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Upper bound on concurrently evaluated agents within one sweep.
const MAX_CONCURRENT_CHECKS: usize = 8;

pub struct Watchdog {
    config: WatchdogConfig,
    status: Arc<StatusEngine>,
    storage: Arc<dyn StorageDriver>,
    locks: Arc<AgentLocks>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        status: Arc<StatusEngine>,
        storage: Arc<dyn StorageDriver>,
        locks: Arc<AgentLocks>,
    ) -> Self {
        Self {
            config,
            status,
            storage,
            locks,
            task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. A disabled or already-running
    /// watchdog is left untouched.
    pub fn start(&self) {
        if !self.config.enabled {
            debug!("watchdog disabled, not starting");
            return;
        }

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let status = Arc::clone(&self.status);
        let storage = Arc::clone(&self.storage);
        let locks = Arc::clone(&self.locks);
        let check_interval = Duration::from_millis(self.config.check_interval_ms);

        info!(interval_ms = self.config.check_interval_ms, "watchdog started");

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            // Skip missed ticks to prevent backlog under load.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&status, &storage, &locks).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("watchdog stopped");
                        break;
                    }
                }
            }
        }));

        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
    }

    /// Cancel the periodic task and wait for it to wind down.
    /// Idempotent.
    pub async fn stop(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Run one evaluation for a single agent, synchronously with the
    /// caller.
    pub async fn force_check(&self, agent_id: &str) {
        check_agent(&self.status, &self.locks, agent_id).await;
    }

    /// Run one full sweep, synchronously with the caller.
    pub async fn force_check_all(&self) {
        sweep(&self.status, &self.storage, &self.locks).await;
    }
}

/// One pass over every known agent, bounded-concurrent.
async fn sweep(
    status: &Arc<StatusEngine>,
    storage: &Arc<dyn StorageDriver>,
    locks: &Arc<AgentLocks>,
) {
    let agents = match storage.all_agents().await {
        Ok(agents) => agents,
        Err(e) => {
            error!(error = %e, "watchdog failed to enumerate agents");
            return;
        }
    };

    debug!(agents = agents.len(), "watchdog sweep");

    stream::iter(agents)
        .for_each_concurrent(MAX_CONCURRENT_CHECKS, |agent_id| {
            let status = Arc::clone(status);
            let locks = Arc::clone(locks);
            async move {
                check_agent(&status, &locks, &agent_id).await;
            }
        })
        .await;
}

async fn check_agent(status: &Arc<StatusEngine>, locks: &Arc<AgentLocks>, agent_id: &str) {
    let _guard = locks.lock(agent_id).await;
    if let Err(e) = status.check_by_time(agent_id).await {
        error!(agent_id = %agent_id, error = %e, "watchdog check failed, continuing sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Thresholds;
    use crate::model::{AgentState, AgentStatus};
    use crate::storage::MemoryDriver;

    const T0: i64 = 1_700_000_000_000;

    async fn seeded_storage() -> Arc<MemoryDriver> {
        let storage = Arc::new(MemoryDriver::new());
        storage.initialize().await.unwrap();
        storage
            .save_status("a", AgentStatus::Active, T0)
            .await
            .unwrap();
        let mut state = AgentState::synthesized("a", AgentStatus::Active, T0);
        state.last_update = T0;
        storage.save_agent_state(&state).await.unwrap();
        storage
    }

    fn watchdog(
        storage: Arc<MemoryDriver>,
        clock: Arc<ManualClock>,
        config: WatchdogConfig,
    ) -> Watchdog {
        let status = Arc::new(StatusEngine::new(
            Arc::clone(&storage) as Arc<dyn StorageDriver>,
            Thresholds::default(),
            clock as Arc<dyn Clock>,
        ));
        Watchdog::new(
            config,
            status,
            storage as Arc<dyn StorageDriver>,
            Arc::new(AgentLocks::new()),
        )
    }

    #[tokio::test]
    async fn force_check_all_applies_time_transitions() {
        let storage = seeded_storage().await;
        let clock = Arc::new(ManualClock::new(T0 + 31_000));
        let dog = watchdog(Arc::clone(&storage), clock, WatchdogConfig::default());

        dog.force_check_all().await;
        assert_eq!(
            storage.status("a").await.unwrap(),
            Some(AgentStatus::Unreachable)
        );
    }

    #[tokio::test]
    async fn force_check_targets_one_agent() {
        let storage = seeded_storage().await;
        storage
            .save_status("b", AgentStatus::Active, T0)
            .await
            .unwrap();
        let mut state = AgentState::synthesized("b", AgentStatus::Active, T0);
        state.last_update = T0;
        storage.save_agent_state(&state).await.unwrap();

        let clock = Arc::new(ManualClock::new(T0 + 31_000));
        let dog = watchdog(Arc::clone(&storage), clock, WatchdogConfig::default());

        dog.force_check("a").await;
        assert_eq!(
            storage.status("a").await.unwrap(),
            Some(AgentStatus::Unreachable)
        );
        // Untouched.
        assert_eq!(
            storage.status("b").await.unwrap(),
            Some(AgentStatus::Active)
        );
    }

    #[tokio::test]
    async fn disabled_watchdog_never_starts() {
        let storage = seeded_storage().await;
        let clock = Arc::new(ManualClock::new(T0 + 31_000));
        let dog = watchdog(
            Arc::clone(&storage),
            clock,
            WatchdogConfig {
                enabled: false,
                check_interval_ms: 10,
            },
        );

        dog.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            storage.status("a").await.unwrap(),
            Some(AgentStatus::Active)
        );
        dog.stop().await;
    }

    #[tokio::test]
    async fn periodic_sweep_fires_and_stop_is_idempotent() {
        let storage = seeded_storage().await;
        let clock = Arc::new(ManualClock::new(T0 + 31_000));
        let dog = watchdog(
            Arc::clone(&storage),
            clock,
            WatchdogConfig {
                enabled: true,
                check_interval_ms: 20,
            },
        );

        dog.start();
        // A second start is a no-op.
        dog.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            storage.status("a").await.unwrap(),
            Some(AgentStatus::Unreachable)
        );

        dog.stop().await;
        dog.stop().await;
    }
}
