//! The service facade.
//!
//! [`Beacon`] owns the engines and the storage handle, gates every
//! public operation on the lifecycle, and composes the ingest
//! pipeline: location engine, status detection, geofence check,
//! snapshot write (in that order, so `location.received` always
//! precedes the events it causes and the snapshot lands last).

pub mod locks;

use crate::clock::{Clock, SystemClock};
use crate::config::BeaconConfig;
use crate::error::BeaconError;
use crate::geofence::{GeofenceEngine, Zone};
use crate::location::LocationEngine;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::status::StatusEngine;
use crate::storage::{EventHandler, StorageDriver};
use crate::watchdog::Watchdog;
use locks::AgentLocks;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct Beacon {
    config: Arc<BeaconConfig>,
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    location: LocationEngine,
    status: Arc<StatusEngine>,
    geofences: GeofenceEngine,
    watchdog: Watchdog,
    locks: Arc<AgentLocks>,
    initialized: AtomicBool,
}

impl Beacon {
    /// Build the engine against a storage driver, on the wall clock.
    pub fn new(config: BeaconConfig, storage: Arc<dyn StorageDriver>) -> Self {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    /// Build with an injected time source. All threshold comparisons
    /// go through it, so tests can advance time deterministically.
    pub fn with_clock(
        config: BeaconConfig,
        storage: Arc<dyn StorageDriver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(AgentLocks::new());

        let location = LocationEngine::new(
            Arc::clone(&storage),
            config.thresholds.clone(),
            Arc::clone(&clock),
        );
        let status = Arc::new(StatusEngine::new(
            Arc::clone(&storage),
            config.thresholds.clone(),
            Arc::clone(&clock),
        ));
        let geofences = GeofenceEngine::new(Arc::clone(&storage), Arc::clone(&clock));
        let watchdog = Watchdog::new(
            config.watchdog.clone(),
            Arc::clone(&status),
            Arc::clone(&storage),
            Arc::clone(&locks),
        );

        Self {
            config,
            storage,
            clock,
            location,
            status,
            geofences,
            watchdog,
            locks,
            initialized: AtomicBool::new(false),
        }
    }

    /// Connect storage and start the watchdog.
    pub async fn initialize(&self) -> Result<(), BeaconError> {
        self.storage.initialize().await?;
        self.watchdog.start();
        self.initialized.store(true, Ordering::SeqCst);
        info!("tracking service initialized");
        Ok(())
    }

    /// Stop the watchdog and release the backend. Idempotent; after
    /// shutdown no ingest is accepted until a fresh `initialize`.
    pub async fn shutdown(&self) -> Result<(), BeaconError> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.watchdog.stop().await;
        self.storage.disconnect().await?;
        info!("tracking service shut down");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), BeaconError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BeaconError::NotInitialized)
        }
    }

    /// Ingest one position report and run the full pipeline.
    pub async fn track(
        &self,
        agent_id: &str,
        lat: f64,
        lon: f64,
        timestamp: Option<i64>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<LocationSample, BeaconError> {
        self.ensure_initialized()?;
        let _guard = self.locks.lock(agent_id).await;

        let outcome = self
            .location
            .ingest(agent_id, lat, lon, timestamp, metadata)
            .await?;

        let status = self.status.detect(agent_id, &outcome).await?;

        let active_geofences = if self.config.geofence.enabled {
            self.geofences.check(agent_id, &outcome.sample).await?
        } else {
            self.geofences.membership(agent_id)
        };

        // Snapshot write is the last effect of the pipeline.
        let previous_state = self.storage.agent_state(agent_id).await?;
        let now = self.clock.now_ms();
        let moved = outcome.sample.speed_kmh.map_or(false, |s| s > 0.0);

        let state = AgentState {
            agent_id: agent_id.to_string(),
            status,
            last_location: Some(outcome.sample.clone()),
            last_update: now,
            last_movement: if moved {
                Some(now)
            } else {
                previous_state.as_ref().and_then(|s| s.last_movement)
            },
            total_distance_m: previous_state
                .as_ref()
                .map(|s| s.total_distance_m)
                .unwrap_or(0.0)
                + outcome.distance_m,
            active_geofences,
        };
        self.storage.save_agent_state(&state).await?;

        Ok(outcome.sample)
    }

    pub async fn get_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, BeaconError> {
        self.ensure_initialized()?;
        self.location.current_location(agent_id).await
    }

    pub async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.status(agent_id).await?)
    }

    pub async fn get_agent_state(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentState>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.agent_state(agent_id).await?)
    }

    pub async fn get_all_agents(&self) -> Result<Vec<String>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.all_agents().await?)
    }

    /// Force a status, bypassing thresholds.
    pub async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        let _guard = self.locks.lock(agent_id).await;
        self.status.set_status(agent_id, status, reason).await
    }

    pub fn register_geofence(&self, zone: Zone) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        self.geofences.register(zone)
    }

    pub fn remove_geofence(&self, zone_id: &str) -> Result<bool, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.remove(zone_id))
    }

    pub fn get_geofences(&self) -> Result<Vec<Zone>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.zones())
    }

    pub fn get_geofence(&self, zone_id: &str) -> Result<Option<Zone>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.zone(zone_id))
    }

    /// Full records of the zones currently containing the agent.
    pub fn get_agent_geofences(&self, agent_id: &str) -> Result<Vec<Zone>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.agent_zones(agent_id))
    }

    pub fn is_agent_in_geofence(
        &self,
        agent_id: &str,
        zone_id: &str,
    ) -> Result<bool, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.is_agent_in(agent_id, zone_id))
    }

    pub fn get_agents_in_geofence(&self, zone_id: &str) -> Result<Vec<String>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.geofences.agents_in(zone_id))
    }

    pub fn clear_agent_geofences(&self, agent_id: &str) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        self.geofences.clear_agent(agent_id);
        Ok(())
    }

    pub async fn subscribe_events(&self, handler: EventHandler) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.subscribe_events(handler).await?)
    }

    pub async fn unsubscribe_events(&self) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.unsubscribe_events().await?)
    }

    pub async fn get_agent_stats(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentStats>, BeaconError> {
        self.ensure_initialized()?;
        Ok(self.storage.agent_stats(agent_id).await?)
    }

    /// Remove every trace of the agent: storage rows and geofence
    /// membership.
    pub async fn clear_agent_data(&self, agent_id: &str) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        let _guard = self.locks.lock(agent_id).await;
        self.storage.clear_agent_data(agent_id).await?;
        self.geofences.clear_agent(agent_id);
        Ok(())
    }

    /// Great-circle meters between two agents' last samples.
    pub async fn distance_between_agents(
        &self,
        agent_a: &str,
        agent_b: &str,
    ) -> Result<Option<f64>, BeaconError> {
        self.ensure_initialized()?;
        self.location.distance_between(agent_a, agent_b).await
    }

    pub async fn force_watchdog_check(&self, agent_id: &str) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        self.watchdog.force_check(agent_id).await;
        Ok(())
    }

    pub async fn force_watchdog_check_all(&self) -> Result<(), BeaconError> {
        self.ensure_initialized()?;
        self.watchdog.force_check_all().await;
        Ok(())
    }
}
