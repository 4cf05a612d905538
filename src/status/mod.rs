//! Presence state machine.
//!
//! Status moves on two triggers: ingest (`detect`, comparing the new
//! sample against the previous one) and the watchdog sweep
//! (`check_by_time`, comparing the snapshot's timestamps against the
//! thresholds). Every persisted transition emits `status.changed` plus
//! at most one specialized event.

#[cfg(test)]
mod tests;

use crate::clock::Clock;
use crate::config::Thresholds;
use crate::error::BeaconError;
use crate::event::{BeaconEvent, EventBody};
use crate::location::IngestOutcome;
use crate::model::{AgentState, AgentStatus};
use crate::storage::StorageDriver;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StatusEngine {
    storage: Arc<dyn StorageDriver>,
    thresholds: Thresholds,
    clock: Arc<dyn Clock>,
}

impl StatusEngine {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        thresholds: Thresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            thresholds,
            clock,
        }
    }

    /// Event-driven classification on a fresh sample.
    ///
    /// A sample arriving after a silence longer than
    /// `unreachable_after_ms` always classifies as ACTIVE ("back
    /// online"), overriding the speed rule.
    pub async fn detect(
        &self,
        agent_id: &str,
        outcome: &IngestOutcome,
    ) -> Result<AgentStatus, BeaconError> {
        let new_status = match &outcome.previous {
            None => AgentStatus::Active,
            Some(prev) => {
                let silence_ms = outcome.sample.timestamp - prev.timestamp;
                if silence_ms > self.thresholds.unreachable_after_ms {
                    AgentStatus::Active
                } else if outcome.sample.speed_kmh.unwrap_or(0.0) >= self.thresholds.min_speed_kmh
                {
                    AgentStatus::Moving
                } else {
                    AgentStatus::Stopped
                }
            }
        };

        let current = self
            .storage
            .status(agent_id)
            .await?
            // An agent with no persisted status compares as OFFLINE,
            // so its first sample emits OFFLINE -> ACTIVE.
            .unwrap_or(AgentStatus::Offline);

        if current != new_status {
            self.apply_transition(agent_id, current, new_status, None)
                .await?;
        }

        Ok(new_status)
    }

    /// Time-driven re-evaluation from the watchdog.
    ///
    /// Checks fire in order (offline, else unreachable, then idle) and
    /// each applied transition updates the working status before the
    /// next check, so prolonged silence settles on OFFLINE rather than
    /// degrading to IDLE.
    pub async fn check_by_time(&self, agent_id: &str) -> Result<AgentStatus, BeaconError> {
        let now = self.clock.now_ms();
        let mut current = self
            .storage
            .status(agent_id)
            .await?
            .unwrap_or(AgentStatus::Offline);

        let Some(state) = self.storage.agent_state(agent_id).await? else {
            // Nothing known about the agent: unknown means OFFLINE.
            if current != AgentStatus::Offline {
                self.apply_transition(agent_id, current, AgentStatus::Offline, None)
                    .await?;
            }
            return Ok(AgentStatus::Offline);
        };

        let silence_ms = now - state.last_update;

        if silence_ms > self.thresholds.offline_after_ms && current != AgentStatus::Offline {
            self.apply_transition(agent_id, current, AgentStatus::Offline, None)
                .await?;
            current = AgentStatus::Offline;
        } else if silence_ms > self.thresholds.unreachable_after_ms
            && !matches!(current, AgentStatus::Unreachable | AgentStatus::Offline)
        {
            self.apply_transition(agent_id, current, AgentStatus::Unreachable, None)
                .await?;
            current = AgentStatus::Unreachable;
        }

        if let Some(last_movement) = state.last_movement {
            if now - last_movement > self.thresholds.idle_after_ms
                && matches!(current, AgentStatus::Active | AgentStatus::Moving)
            {
                self.apply_transition(agent_id, current, AgentStatus::Idle, None)
                    .await?;
                current = AgentStatus::Idle;
            }
        }

        Ok(current)
    }

    /// Manual override, bypassing every threshold.
    pub async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<(), BeaconError> {
        let current = self
            .storage
            .status(agent_id)
            .await?
            .unwrap_or(AgentStatus::Offline);
        if current != status {
            self.apply_transition(agent_id, current, status, reason)
                .await?;
        }
        Ok(())
    }

    /// Persist the transition and emit `status.changed` plus the
    /// matching specialized event. Callers guarantee `old != new`.
    async fn apply_transition(
        &self,
        agent_id: &str,
        old: AgentStatus,
        new: AgentStatus,
        reason: Option<String>,
    ) -> Result<(), BeaconError> {
        let now = self.clock.now_ms();

        self.storage.save_status(agent_id, new, now).await?;

        info!(
            agent_id = %agent_id,
            old = %old,
            new = %new,
            "status transition"
        );

        let changed = BeaconEvent::new(
            now,
            EventBody::StatusChanged {
                agent_id: agent_id.to_string(),
                old_status: old,
                new_status: new,
                timestamp: now,
                reason,
            },
        );
        self.storage.publish_event(&changed).await?;

        if let Some(body) = self.specialized_body(agent_id, old, new, now).await? {
            let event = BeaconEvent::new(now, body);
            self.storage.publish_event(&event).await?;
        }

        Ok(())
    }

    /// One specialized event per transition class, carrying the stored
    /// snapshot or a synthesized minimal one.
    async fn specialized_body(
        &self,
        agent_id: &str,
        old: AgentStatus,
        new: AgentStatus,
        now: i64,
    ) -> Result<Option<EventBody>, BeaconError> {
        use AgentStatus::*;

        let classify = |state: AgentState| match (old, new) {
            (_, Unreachable) => Some(EventBody::AgentUnreachable { state }),
            (Unreachable | Offline, Active | Moving) => {
                Some(EventBody::AgentBackOnline { state })
            }
            (_, Idle) => Some(EventBody::AgentIdle { state }),
            (Idle | Stopped, Active) => Some(EventBody::AgentActive { state }),
            _ => None,
        };

        // Cheap pre-check to skip the snapshot read for transitions
        // that never specialize.
        let specializes = matches!(
            (old, new),
            (_, Unreachable)
                | (Unreachable | Offline, Active | Moving)
                | (_, Idle)
                | (Idle | Stopped, Active)
        );
        if !specializes {
            return Ok(None);
        }

        let state = match self.storage.agent_state(agent_id).await? {
            Some(mut state) => {
                state.status = new;
                state
            }
            None => AgentState::synthesized(agent_id, new, now),
        };

        debug!(agent_id = %agent_id, new = %new, "emitting specialized status event");
        Ok(classify(state))
    }
}
