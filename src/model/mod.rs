//! Domain types shared across engines and storage backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A geographic coordinate in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// A single accepted location observation. Immutable once built by the
/// location engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub agent_id: String,
    pub coordinate: Coordinate,
    /// Epoch milliseconds, already validated against clock skew.
    pub timestamp: i64,
    /// Derived speed in km/h; absent on an agent's first sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    /// Derived heading in degrees [0, 360); absent when the agent was
    /// effectively stationary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Presence classification of an agent. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Active,
    Idle,
    Moving,
    Stopped,
    Unreachable,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Idle => "IDLE",
            Self::Moving => "MOVING",
            Self::Stopped => "STOPPED",
            Self::Unreachable => "UNREACHABLE",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent state snapshot maintained by the service facade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<LocationSample>,
    /// Epoch ms of the most recent observation or status change.
    pub last_update: i64,
    /// Epoch ms of the most recent sample with speed > 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_movement: Option<i64>,
    /// Accumulated great-circle meters. Monotonically non-decreasing.
    pub total_distance_m: f64,
    /// Zone ids whose geometry contains the last sample.
    #[serde(default)]
    pub active_geofences: HashSet<String>,
}

impl AgentState {
    /// Minimal snapshot for agents that have a status but no stored
    /// state yet.
    pub fn synthesized(agent_id: &str, status: AgentStatus, now_ms: i64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status,
            last_location: None,
            last_update: now_ms,
            last_movement: None,
            total_distance_m: 0.0,
            active_geofences: HashSet::new(),
        }
    }
}

/// Per-agent ingest counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_locations: u64,
    pub total_distance_m: f64,
    pub last_update: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&AgentStatus::Unreachable).unwrap();
        assert_eq!(json, "\"UNREACHABLE\"");
        let back: AgentStatus = serde_json::from_str("\"MOVING\"").unwrap();
        assert_eq!(back, AgentStatus::Moving);
    }

    #[test]
    fn sample_omits_absent_derived_fields() {
        let sample = LocationSample {
            agent_id: "a".to_string(),
            coordinate: Coordinate::new(40.7128, -74.0060),
            timestamp: 1_700_000_000_000,
            speed_kmh: None,
            heading_deg: None,
            metadata: None,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert!(json.get("speed_kmh").is_none());
        assert!(json.get("heading_deg").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut zones = HashSet::new();
        zones.insert("depot".to_string());
        let state = AgentState {
            agent_id: "truck-7".to_string(),
            status: AgentStatus::Moving,
            last_location: None,
            last_update: 1_700_000_000_000,
            last_movement: Some(1_700_000_000_000),
            total_distance_m: 1234.5,
            active_geofences: zones,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "truck-7");
        assert_eq!(back.status, AgentStatus::Moving);
        assert!(back.active_geofences.contains("depot"));
    }
}
