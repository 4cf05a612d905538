//! Process-local read-side state.
//!
//! Pub/sub-only backends (MQTT, websocket, the JetStream event log)
//! cannot answer point reads from their transport, so each adapter
//! keeps this mirror, populated on every write through the contract.
//! The in-memory driver uses it as its entire store.

use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Default)]
pub(crate) struct StateMirror {
    locations: DashMap<String, LocationSample>,
    statuses: DashMap<String, (AgentStatus, i64)>,
    states: DashMap<String, AgentState>,
    stats: DashMap<String, AgentStats>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_location(&self, agent_id: &str, sample: &LocationSample) {
        self.locations.insert(agent_id.to_string(), sample.clone());
        let mut stats = self.stats.entry(agent_id.to_string()).or_default();
        stats.total_locations += 1;
        stats.last_update = sample.timestamp;
    }

    pub fn last_location(&self, agent_id: &str) -> Option<LocationSample> {
        self.locations.get(agent_id).map(|s| s.clone())
    }

    pub fn save_status(&self, agent_id: &str, status: AgentStatus, timestamp: i64) {
        self.statuses
            .insert(agent_id.to_string(), (status, timestamp));
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.statuses.get(agent_id).map(|s| s.0)
    }

    pub fn save_state(&self, state: &AgentState) {
        // The snapshot carries the accumulated distance; keep the
        // stats counter in lockstep.
        let mut stats = self.stats.entry(state.agent_id.clone()).or_default();
        stats.total_distance_m = state.total_distance_m;
        drop(stats);
        self.states.insert(state.agent_id.clone(), state.clone());
    }

    pub fn state(&self, agent_id: &str) -> Option<AgentState> {
        self.states.get(agent_id).map(|s| s.clone())
    }

    pub fn stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.stats.get(agent_id).map(|s| s.clone())
    }

    /// Union of agent ids across every stored kind.
    pub fn all_agents(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for entry in self.locations.iter() {
            ids.insert(entry.key().clone());
        }
        for entry in self.statuses.iter() {
            ids.insert(entry.key().clone());
        }
        for entry in self.states.iter() {
            ids.insert(entry.key().clone());
        }
        for entry in self.stats.iter() {
            ids.insert(entry.key().clone());
        }
        ids.into_iter().collect()
    }

    pub fn clear_agent(&self, agent_id: &str) {
        self.locations.remove(agent_id);
        self.statuses.remove(agent_id);
        self.states.remove(agent_id);
        self.stats.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Coordinate;

    fn sample(agent_id: &str, ts: i64) -> LocationSample {
        LocationSample {
            agent_id: agent_id.to_string(),
            coordinate: Coordinate::new(40.0, -74.0),
            timestamp: ts,
            speed_kmh: None,
            heading_deg: None,
            metadata: None,
        }
    }

    #[test]
    fn save_location_bumps_counters() {
        let mirror = StateMirror::new();
        mirror.save_location("a", &sample("a", 100));
        mirror.save_location("a", &sample("a", 200));

        let stats = mirror.stats("a").unwrap();
        assert_eq!(stats.total_locations, 2);
        assert_eq!(stats.last_update, 200);
    }

    #[test]
    fn save_state_mirrors_distance_into_stats() {
        let mirror = StateMirror::new();
        mirror.save_location("a", &sample("a", 100));

        let mut state = AgentState::synthesized("a", AgentStatus::Moving, 100);
        state.total_distance_m = 1500.0;
        mirror.save_state(&state);

        let stats = mirror.stats("a").unwrap();
        assert_eq!(stats.total_locations, 1);
        assert_eq!(stats.total_distance_m, 1500.0);
    }

    #[test]
    fn all_agents_dedups_across_kinds() {
        let mirror = StateMirror::new();
        mirror.save_location("a", &sample("a", 1));
        mirror.save_status("a", AgentStatus::Active, 1);
        mirror.save_status("b", AgentStatus::Offline, 1);
        mirror.save_state(&AgentState::synthesized("c", AgentStatus::Active, 1));

        let agents = mirror.all_agents();
        assert_eq!(agents, vec!["a", "b", "c"]);
    }

    #[test]
    fn clear_removes_every_kind() {
        let mirror = StateMirror::new();
        mirror.save_location("a", &sample("a", 1));
        mirror.save_status("a", AgentStatus::Active, 1);
        mirror.save_state(&AgentState::synthesized("a", AgentStatus::Active, 1));

        mirror.clear_agent("a");
        assert!(mirror.last_location("a").is_none());
        assert!(mirror.status("a").is_none());
        assert!(mirror.state("a").is_none());
        assert!(mirror.stats("a").is_none());
        assert!(mirror.all_agents().is_empty());
    }
}
