//! In-memory backend.
//!
//! The development and test driver: all state lives in process, and
//! publish is a synchronous best-effort fan-out. A failing handler is
//! logged and skipped; it never unwinds the publish loop.

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::storage::mirror::StateMirror;
use crate::storage::{EventHandler, StorageDriver};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, error};

#[derive(Default)]
pub struct MemoryDriver {
    mirror: StateMirror,
    handlers: RwLock<Vec<EventHandler>>,
    connected: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection(
                "memory driver is not initialized".to_string(),
            ))
        }
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("memory driver initialized");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn save_location(
        &self,
        agent_id: &str,
        sample: &LocationSample,
    ) -> Result<(), StorageError> {
        self.ensure_connected()?;
        self.mirror.save_location(agent_id, sample);
        Ok(())
    }

    async fn last_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, StorageError> {
        self.ensure_connected()?;
        Ok(self.mirror.last_location(agent_id))
    }

    async fn save_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        self.ensure_connected()?;
        self.mirror.save_status(agent_id, status, timestamp);
        Ok(())
    }

    async fn status(&self, agent_id: &str) -> Result<Option<AgentStatus>, StorageError> {
        self.ensure_connected()?;
        Ok(self.mirror.status(agent_id))
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<(), StorageError> {
        self.ensure_connected()?;
        self.mirror.save_state(state);
        Ok(())
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StorageError> {
        self.ensure_connected()?;
        Ok(self.mirror.state(agent_id))
    }

    async fn all_agents(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_connected()?;
        Ok(self.mirror.all_agents())
    }

    async fn publish_event(&self, event: &BeaconEvent) -> Result<(), StorageError> {
        self.ensure_connected()?;
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            if let Err(e) = handler(event) {
                error!(
                    kind = event.kind().as_str(),
                    error = %e,
                    "event handler failed, continuing fan-out"
                );
            }
        }
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<(), StorageError> {
        self.ensure_connected()?;
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
        Ok(())
    }

    async fn unsubscribe_events(&self) -> Result<(), StorageError> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>, StorageError> {
        self.ensure_connected()?;
        Ok(self.mirror.stats(agent_id))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<(), StorageError> {
        self.ensure_connected()?;
        self.mirror.clear_agent(agent_id);
        Ok(())
    }
}
