// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// Time source and utilities
pub mod clock;

// Pure geographic math
pub mod geo;

// Domain types
pub mod model;

// Event envelope and taxonomy
pub mod event;

// Storage driver contract and backends
pub mod storage;

// Location ingest pipeline
pub mod location;

// Presence state machine
pub mod status;

// Zone registry and membership
pub mod geofence;

// Background sweeper
pub mod watchdog;

// Service facade
pub mod service;

// Logging sink assembly
pub mod logging;

// Re-exports for embedders
pub use config::BeaconConfig;
pub use error::{BeaconError, StorageError};
pub use event::{BeaconEvent, EventBody, EventKind};
pub use geofence::{Geometry, Zone};
pub use model::{AgentState, AgentStats, AgentStatus, Coordinate, LocationSample};
pub use service::Beacon;
pub use storage::{EventHandler, MemoryDriver, StorageDriver};
