//! The storage driver contract.
//!
//! Every backend implements [`StorageDriver`]; it is the
//! substitutability boundary of the engine. Delivery semantics differ
//! per backend and are deliberately not normalized here: the in-memory
//! driver fans out synchronously best-effort, the JetStream driver
//! offers replay, the MQTT driver rides QoS 1 acknowledgment, and the
//! websocket driver broadcasts to connected clients.

mod mirror;

pub mod jetstream;
pub mod kv;
pub mod memory;
pub mod mqtt;
pub mod websocket;

pub use jetstream::{JetStreamConfig, JetStreamDriver};
pub use kv::{NatsKvConfig, NatsKvDriver};
pub use memory::MemoryDriver;
pub use mqtt::{MqttConfig, MqttDriver};
pub use websocket::{WebSocketConfig, WebSocketDriver};

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked for every event published after subscription.
///
/// A handler returning `Err` is logged at the publish site and never
/// stops delivery to other handlers.
pub type EventHandler = Arc<dyn Fn(&BeaconEvent) -> anyhow::Result<()> + Send + Sync>;

/// The operations every backend must satisfy.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Connect and prepare backend resources.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Release backend resources. Idempotent.
    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Persist a sample as the agent's last location and bump its
    /// counters (`total_locations`, `last_update`).
    async fn save_location(
        &self,
        agent_id: &str,
        sample: &LocationSample,
    ) -> Result<(), StorageError>;

    async fn last_location(&self, agent_id: &str)
        -> Result<Option<LocationSample>, StorageError>;

    async fn save_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timestamp: i64,
    ) -> Result<(), StorageError>;

    async fn status(&self, agent_id: &str) -> Result<Option<AgentStatus>, StorageError>;

    /// Persist the snapshot; also mirrors its accumulated distance
    /// into the agent's stats.
    async fn save_agent_state(&self, state: &AgentState) -> Result<(), StorageError>;

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StorageError>;

    /// Every agent id known to any stored kind, deduplicated.
    async fn all_agents(&self) -> Result<Vec<String>, StorageError>;

    /// Deliver the event to all subscribers per backend semantics.
    async fn publish_event(&self, event: &BeaconEvent) -> Result<(), StorageError>;

    /// Register a handler invoked for every subsequently published
    /// event until [`StorageDriver::unsubscribe_events`].
    async fn subscribe_events(&self, handler: EventHandler) -> Result<(), StorageError>;

    /// Drop all registered handlers. Idempotent.
    async fn unsubscribe_events(&self) -> Result<(), StorageError>;

    async fn agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>, StorageError>;

    /// Remove the agent's location, status, state and stats.
    async fn clear_agent_data(&self, agent_id: &str) -> Result<(), StorageError>;
}
