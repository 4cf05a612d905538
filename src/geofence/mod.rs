//! Zone registry and membership tracking.
//!
//! The engine owns the zone registry and the per-agent membership
//! sets; membership is recomputed on every checked sample and the
//! delta is emitted as enter/exit events. Removing a zone clears it
//! from every membership set silently: removal is an admin operation,
//! not a movement.

pub mod zone;


pub use zone::{Geometry, Zone, ZoneValidationError};

use crate::clock::Clock;
use crate::error::BeaconError;
use crate::event::{BeaconEvent, CrossingDirection, EventBody, GeofenceCrossing};
use crate::geo;
use crate::model::LocationSample;
use crate::storage::StorageDriver;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct GeofenceEngine {
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    zones: DashMap<String, Zone>,
    memberships: DashMap<String, HashSet<String>>,
}

impl GeofenceEngine {
    pub fn new(storage: Arc<dyn StorageDriver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            zones: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    /// Insert or overwrite a zone. Memberships are not recomputed
    /// retroactively; they catch up on each agent's next check.
    pub fn register(&self, zone: Zone) -> Result<(), BeaconError> {
        if let Err(errors) = zone.validate() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BeaconError::InvalidInput(format!(
                "invalid zone '{}': {}",
                zone.id, joined
            )));
        }

        info!(zone_id = %zone.id, name = %zone.name, "zone registered");
        self.zones.insert(zone.id.clone(), zone);
        Ok(())
    }

    /// Erase a zone and scrub it from every membership set. No exit
    /// events are emitted.
    pub fn remove(&self, zone_id: &str) -> bool {
        let removed = self.zones.remove(zone_id).is_some();
        if removed {
            for mut membership in self.memberships.iter_mut() {
                membership.value_mut().remove(zone_id);
            }
            info!(zone_id = %zone_id, "zone removed");
        }
        removed
    }

    /// Recompute the agent's membership against every registered zone
    /// and emit the delta. Returns the new membership set.
    pub async fn check(
        &self,
        agent_id: &str,
        sample: &LocationSample,
    ) -> Result<HashSet<String>, BeaconError> {
        let mut containing: Vec<(String, String)> = Vec::new();
        let mut new_set = HashSet::new();

        for entry in self.zones.iter() {
            if geo::point_in_zone(sample.coordinate, entry.value()) {
                new_set.insert(entry.key().clone());
                containing.push((entry.key().clone(), entry.value().name.clone()));
            }
        }

        let current = self
            .memberships
            .get(agent_id)
            .map(|m| m.clone())
            .unwrap_or_default();

        let now = self.clock.now_ms();

        for (zone_id, zone_name) in &containing {
            if current.contains(zone_id) {
                continue;
            }
            debug!(agent_id = %agent_id, zone_id = %zone_id, "geofence enter");
            let event = BeaconEvent::new(
                now,
                EventBody::EnteredGeofence(GeofenceCrossing {
                    agent_id: agent_id.to_string(),
                    zone_id: zone_id.clone(),
                    zone_name: zone_name.clone(),
                    sample: sample.clone(),
                    timestamp: now,
                    direction: CrossingDirection::Enter,
                }),
            );
            self.storage.publish_event(&event).await?;
        }

        for zone_id in current.difference(&new_set) {
            // The zone may have been overwritten since entry; fall
            // back to its id when the record is gone.
            let zone_name = self
                .zones
                .get(zone_id)
                .map(|z| z.name.clone())
                .unwrap_or_else(|| zone_id.clone());
            debug!(agent_id = %agent_id, zone_id = %zone_id, "geofence exit");
            let event = BeaconEvent::new(
                now,
                EventBody::ExitedGeofence(GeofenceCrossing {
                    agent_id: agent_id.to_string(),
                    zone_id: zone_id.clone(),
                    zone_name,
                    sample: sample.clone(),
                    timestamp: now,
                    direction: CrossingDirection::Exit,
                }),
            );
            self.storage.publish_event(&event).await?;
        }

        self.memberships
            .insert(agent_id.to_string(), new_set.clone());
        Ok(new_set)
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.zones.iter().map(|z| z.value().clone()).collect()
    }

    pub fn zone(&self, zone_id: &str) -> Option<Zone> {
        self.zones.get(zone_id).map(|z| z.clone())
    }

    /// Full zone records the agent is currently inside.
    pub fn agent_zones(&self, agent_id: &str) -> Vec<Zone> {
        let Some(membership) = self.memberships.get(agent_id) else {
            return Vec::new();
        };
        membership
            .iter()
            .filter_map(|id| self.zones.get(id).map(|z| z.clone()))
            .collect()
    }

    pub fn membership(&self, agent_id: &str) -> HashSet<String> {
        self.memberships
            .get(agent_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn is_agent_in(&self, agent_id: &str, zone_id: &str) -> bool {
        self.memberships
            .get(agent_id)
            .map(|m| m.contains(zone_id))
            .unwrap_or(false)
    }

    pub fn agents_in(&self, zone_id: &str) -> Vec<String> {
        let mut agents: Vec<String> = self
            .memberships
            .iter()
            .filter(|m| m.value().contains(zone_id))
            .map(|m| m.key().clone())
            .collect();
        agents.sort();
        agents
    }

    pub fn clear_agent(&self, agent_id: &str) {
        self.memberships.remove(agent_id);
    }
}
