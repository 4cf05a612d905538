//! Event envelope and the wire-stable taxonomy.
//!
//! Every observable change flows through a [`BeaconEvent`]: a UUIDv7
//! id, the emission timestamp, and a payload tagged with one of the
//! eight taxonomy strings. Backends serialize the envelope as JSON and
//! must carry the `kind` tag verbatim.

use crate::model::{AgentState, AgentStatus, LocationSample};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminant of the event taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "location.received")]
    LocationReceived,
    #[serde(rename = "status.changed")]
    StatusChanged,
    #[serde(rename = "agent.unreachable")]
    AgentUnreachable,
    #[serde(rename = "agent.back-online")]
    AgentBackOnline,
    #[serde(rename = "agent.idle")]
    AgentIdle,
    #[serde(rename = "agent.active")]
    AgentActive,
    #[serde(rename = "agent.entered-geofence")]
    EnteredGeofence,
    #[serde(rename = "agent.exited-geofence")]
    ExitedGeofence,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocationReceived => "location.received",
            Self::StatusChanged => "status.changed",
            Self::AgentUnreachable => "agent.unreachable",
            Self::AgentBackOnline => "agent.back-online",
            Self::AgentIdle => "agent.idle",
            Self::AgentActive => "agent.active",
            Self::EnteredGeofence => "agent.entered-geofence",
            Self::ExitedGeofence => "agent.exited-geofence",
        }
    }
}

/// Direction of a geofence boundary crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingDirection {
    Enter,
    Exit,
}

/// Payload of a geofence enter/exit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeofenceCrossing {
    pub agent_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub sample: LocationSample,
    pub timestamp: i64,
    pub direction: CrossingDirection,
}

/// Typed event payload, tagged on the wire with the taxonomy string.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventBody {
    #[serde(rename = "location.received")]
    LocationReceived {
        agent_id: String,
        sample: LocationSample,
        /// Great-circle meters from the previous sample; 0 on the
        /// agent's first sample.
        distance_m: f64,
        speed_kmh: f64,
    },
    #[serde(rename = "status.changed")]
    StatusChanged {
        agent_id: String,
        old_status: AgentStatus,
        new_status: AgentStatus,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "agent.unreachable")]
    AgentUnreachable { state: AgentState },
    #[serde(rename = "agent.back-online")]
    AgentBackOnline { state: AgentState },
    #[serde(rename = "agent.idle")]
    AgentIdle { state: AgentState },
    #[serde(rename = "agent.active")]
    AgentActive { state: AgentState },
    #[serde(rename = "agent.entered-geofence")]
    EnteredGeofence(GeofenceCrossing),
    #[serde(rename = "agent.exited-geofence")]
    ExitedGeofence(GeofenceCrossing),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LocationReceived { .. } => EventKind::LocationReceived,
            Self::StatusChanged { .. } => EventKind::StatusChanged,
            Self::AgentUnreachable { .. } => EventKind::AgentUnreachable,
            Self::AgentBackOnline { .. } => EventKind::AgentBackOnline,
            Self::AgentIdle { .. } => EventKind::AgentIdle,
            Self::AgentActive { .. } => EventKind::AgentActive,
            Self::EnteredGeofence(_) => EventKind::EnteredGeofence,
            Self::ExitedGeofence(_) => EventKind::ExitedGeofence,
        }
    }

    /// Agent the event concerns.
    pub fn agent_id(&self) -> &str {
        match self {
            Self::LocationReceived { agent_id, .. } | Self::StatusChanged { agent_id, .. } => {
                agent_id
            }
            Self::AgentUnreachable { state }
            | Self::AgentBackOnline { state }
            | Self::AgentIdle { state }
            | Self::AgentActive { state } => &state.agent_id,
            Self::EnteredGeofence(c) | Self::ExitedGeofence(c) => &c.agent_id,
        }
    }
}

/// The envelope published through the storage contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeaconEvent {
    /// UUIDv7, time-ordered.
    pub event_id: String,
    /// Emission time, epoch milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: EventBody,
}

impl BeaconEvent {
    pub fn new(timestamp: i64, body: EventBody) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            timestamp,
            body,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}
