//! NATS key-value backend.
//!
//! The read side of the contract lives in a JetStream KV bucket (real
//! point reads, unlike the mirror-based adapters), and events fan out
//! over core NATS subjects with the backend's native at-most-once
//! delivery.

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::storage::{EventHandler, StorageDriver};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const KEY_LOCATION: &str = "loc";
const KEY_STATUS: &str = "status";
const KEY_STATE: &str = "state";
const KEY_STATS: &str = "stats";

/// KV backend configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct NatsKvConfig {
    pub url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_bucket() -> String {
    "beacon-agents".to_string()
}

fn default_subject_prefix() -> String {
    "beacon.events".to_string()
}

impl Default for NatsKvConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            bucket: default_bucket(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Status row persisted in the bucket.
#[derive(Serialize, Deserialize)]
struct StatusRecord {
    status: AgentStatus,
    timestamp: i64,
}

/// KV + pub/sub storage driver on NATS.
pub struct NatsKvDriver {
    config: NatsKvConfig,
    client: RwLock<Option<async_nats::Client>>,
    store: RwLock<Option<kv::Store>>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl NatsKvDriver {
    pub fn new(config: NatsKvConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            store: RwLock::new(None),
            handlers: Arc::new(RwLock::new(Vec::new())),
            dispatch_task: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<async_nats::Client, StorageError> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| StorageError::Connection("kv driver is not initialized".to_string()))
    }

    fn store(&self) -> Result<kv::Store, StorageError> {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| StorageError::Connection("kv driver is not initialized".to_string()))
    }

    fn key(kind: &str, agent_id: &str) -> String {
        format!("{}.{}", kind, agent_id)
    }

    async fn put_json<T: Serialize>(&self, key: String, value: &T) -> Result<(), StorageError> {
        let store = self.store()?;
        let payload = serde_json::to_vec(value)?;
        store
            .put(key.as_str(), payload.into())
            .await
            .map_err(|e| StorageError::Backend(format!("kv put '{}' failed: {}", key, e)))?;
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        key: String,
    ) -> Result<Option<T>, StorageError> {
        let store = self.store()?;
        let entry = store
            .get(key.as_str())
            .await
            .map_err(|e| StorageError::Backend(format!("kv get '{}' failed: {}", key, e)))?;
        match entry {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn purge(&self, key: String) -> Result<(), StorageError> {
        let store = self.store()?;
        store
            .purge(key.as_str())
            .await
            .map_err(|e| StorageError::Backend(format!("kv purge '{}' failed: {}", key, e)))?;
        Ok(())
    }

    fn spawn_dispatcher(&self, client: async_nats::Client) {
        let mut task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let subject = format!("{}.>", self.config.subject_prefix);
        let handlers = Arc::clone(&self.handlers);

        *task = Some(tokio::spawn(async move {
            let mut subscription = match client.subscribe(subject.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    error!(subject = %subject, error = %e, "Event dispatcher failed to subscribe");
                    return;
                }
            };

            while let Some(message) = subscription.next().await {
                match serde_json::from_slice::<BeaconEvent>(&message.payload) {
                    Ok(event) => {
                        let handlers = handlers.read().unwrap_or_else(|e| e.into_inner());
                        for handler in handlers.iter() {
                            if let Err(e) = handler(&event) {
                                error!(
                                    kind = event.kind().as_str(),
                                    error = %e,
                                    "event handler failed, continuing fan-out"
                                );
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable event"),
                }
            }
        }));
    }
}

#[async_trait]
impl StorageDriver for NatsKvDriver {
    async fn initialize(&self) -> Result<(), StorageError> {
        info!(url = %self.config.url, bucket = %self.config.bucket, "Connecting to NATS KV");

        let client = async_nats::connect(&self.config.url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to NATS: {}", e)))?;
        let context = jetstream::new(client.clone());

        let store = match context.get_key_value(&self.config.bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: self.config.bucket.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    StorageError::Connection(format!("failed to create kv bucket: {}", e))
                })?,
        };

        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = Some(store);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn save_location(
        &self,
        agent_id: &str,
        sample: &LocationSample,
    ) -> Result<(), StorageError> {
        self.put_json(Self::key(KEY_LOCATION, agent_id), sample)
            .await?;

        // Counters ride in the same bucket.
        let mut stats: AgentStats = self
            .get_json(Self::key(KEY_STATS, agent_id))
            .await?
            .unwrap_or_default();
        stats.total_locations += 1;
        stats.last_update = sample.timestamp;
        self.put_json(Self::key(KEY_STATS, agent_id), &stats).await
    }

    async fn last_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, StorageError> {
        self.get_json(Self::key(KEY_LOCATION, agent_id)).await
    }

    async fn save_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        self.put_json(
            Self::key(KEY_STATUS, agent_id),
            &StatusRecord { status, timestamp },
        )
        .await
    }

    async fn status(&self, agent_id: &str) -> Result<Option<AgentStatus>, StorageError> {
        let record: Option<StatusRecord> = self.get_json(Self::key(KEY_STATUS, agent_id)).await?;
        Ok(record.map(|r| r.status))
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<(), StorageError> {
        let mut stats: AgentStats = self
            .get_json(Self::key(KEY_STATS, &state.agent_id))
            .await?
            .unwrap_or_default();
        stats.total_distance_m = state.total_distance_m;
        self.put_json(Self::key(KEY_STATS, &state.agent_id), &stats)
            .await?;
        self.put_json(Self::key(KEY_STATE, &state.agent_id), state)
            .await
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StorageError> {
        self.get_json(Self::key(KEY_STATE, agent_id)).await
    }

    async fn all_agents(&self) -> Result<Vec<String>, StorageError> {
        let store = self.store()?;
        let mut keys = store
            .keys()
            .await
            .map_err(|e| StorageError::Backend(format!("kv keys failed: {}", e)))?;

        let mut ids = BTreeSet::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| StorageError::Backend(format!("kv keys failed: {}", e)))?;
            if let Some((_, agent_id)) = key.split_once('.') {
                ids.insert(agent_id.to_string());
            }
        }
        Ok(ids.into_iter().collect())
    }

    async fn publish_event(&self, event: &BeaconEvent) -> Result<(), StorageError> {
        let client = self.client()?;
        let subject = format!("{}.{}", self.config.subject_prefix, event.kind().as_str());
        let payload = serde_json::to_vec(event)?;

        debug!(event_id = %event.event_id, subject = %subject, "Publishing event");

        client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                StorageError::Backend(format!("failed to publish to '{}': {}", subject, e))
            })?;
        client
            .flush()
            .await
            .map_err(|e| StorageError::Backend(format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<(), StorageError> {
        let client = self.client()?;
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
        self.spawn_dispatcher(client);
        Ok(())
    }

    async fn unsubscribe_events(&self) -> Result<(), StorageError> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        Ok(())
    }

    async fn agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>, StorageError> {
        self.get_json(Self::key(KEY_STATS, agent_id)).await
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<(), StorageError> {
        self.purge(Self::key(KEY_LOCATION, agent_id)).await?;
        self.purge(Self::key(KEY_STATUS, agent_id)).await?;
        self.purge(Self::key(KEY_STATE, agent_id)).await?;
        self.purge(Self::key(KEY_STATS, agent_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_per_kind() {
        assert_eq!(NatsKvDriver::key(KEY_LOCATION, "truck-7"), "loc.truck-7");
        assert_eq!(NatsKvDriver::key(KEY_STATS, "truck-7"), "stats.truck-7");
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let driver = NatsKvDriver::new(NatsKvConfig::default());
        assert!(matches!(
            driver.status("a").await,
            Err(StorageError::Connection(_))
        ));
    }
}
