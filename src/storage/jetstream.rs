//! NATS JetStream backend.
//!
//! Events are published to a durable JetStream stream, which makes
//! this the log-stream backend: subscribers attach through a consumer
//! and the log can be replayed from any sequence. The read side of the
//! contract is served from the process-local mirror, populated on
//! every write.

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::storage::mirror::StateMirror;
use crate::storage::{EventHandler, StorageDriver};
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// JetStream backend configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct JetStreamConfig {
    pub url: String,
    pub stream_name: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

fn default_subject_prefix() -> String {
    "beacon.events".to_string()
}

fn default_max_age_days() -> i64 {
    7
}

fn default_max_bytes() -> i64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            stream_name: "BEACON_EVENTS".to_string(),
            subject_prefix: default_subject_prefix(),
            max_age_days: default_max_age_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// Log-stream storage driver on NATS JetStream.
pub struct JetStreamDriver {
    config: JetStreamConfig,
    context: RwLock<Option<jetstream::Context>>,
    mirror: StateMirror,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl JetStreamDriver {
    pub fn new(config: JetStreamConfig) -> Self {
        Self {
            config,
            context: RwLock::new(None),
            mirror: StateMirror::new(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            dispatch_task: Mutex::new(None),
        }
    }

    fn context(&self) -> Result<jetstream::Context, StorageError> {
        self.context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                StorageError::Connection("jetstream driver is not initialized".to_string())
            })
    }

    /// Ensure the event stream exists with the configured retention.
    async fn ensure_stream(&self, context: &jetstream::Context) -> Result<(), StorageError> {
        info!(stream = %self.config.stream_name, "Ensuring JetStream stream exists");

        if context.get_stream(&self.config.stream_name).await.is_ok() {
            debug!(stream = %self.config.stream_name, "Stream already exists");
            return Ok(());
        }

        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            max_age: Duration::from_secs((self.config.max_age_days * 86_400) as u64),
            max_bytes: self.config.max_bytes,
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        context
            .create_stream(stream_config)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to create stream: {}", e)))?;

        info!(stream = %self.config.stream_name, "Created JetStream stream");
        Ok(())
    }

    /// Replay persisted events starting at `start_sequence` (1-based
    /// stream sequence), up to `max` messages.
    pub async fn events_from(
        &self,
        start_sequence: u64,
        max: usize,
    ) -> Result<Vec<BeaconEvent>, StorageError> {
        let context = self.context()?;
        let stream = context
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to get stream: {}", e)))?;

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: consumer::DeliverPolicy::ByStartSequence { start_sequence },
                ..Default::default()
            })
            .await
            .map_err(|e| StorageError::Backend(format!("failed to create consumer: {}", e)))?;

        let mut batch = consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(|e| StorageError::Backend(format!("failed to fetch messages: {}", e)))?;

        let mut events = Vec::new();
        while let Some(message) = batch.next().await {
            let message =
                message.map_err(|e| StorageError::Backend(format!("fetch failed: {}", e)))?;
            match serde_json::from_slice::<BeaconEvent>(&message.payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "Skipping undecodable event in replay"),
            }
        }
        Ok(events)
    }

    fn spawn_dispatcher(&self, context: jetstream::Context) {
        let mut task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let stream_name = self.config.stream_name.clone();
        let handlers = Arc::clone(&self.handlers);

        *task = Some(tokio::spawn(async move {
            let stream = match context.get_stream(&stream_name).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Event dispatcher failed to open stream");
                    return;
                }
            };

            let consumer = match stream
                .get_or_create_consumer(
                    "beacon-dispatch",
                    consumer::pull::Config {
                        durable_name: Some("beacon-dispatch".to_string()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "Event dispatcher failed to create consumer");
                    return;
                }
            };

            let mut messages = match consumer.messages().await {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "Event dispatcher failed to open message stream");
                    return;
                }
            };

            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "Event dispatcher stream error");
                        continue;
                    }
                };

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

                if let Err(e) = message.ack().await {
                    warn!(error = %e, "Failed to ack event message");
                }
            }
        }));
    }
}

#[async_trait]
impl StorageDriver for JetStreamDriver {
    async fn initialize(&self) -> Result<(), StorageError> {
        info!(url = %self.config.url, "Connecting to NATS");

        let client = async_nats::connect(&self.config.url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to NATS: {}", e)))?;
        let context = jetstream::new(client);

        self.ensure_stream(&context).await?;

        *self.context.write().unwrap_or_else(|e| e.into_inner()) = Some(context);
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
        *self.context.write().unwrap_or_else(|e| e.into_inner()) = None;
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
        self.context()?;
        self.mirror.save_location(agent_id, sample);
        Ok(())
    }

    async fn last_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, StorageError> {
        self.context()?;
        Ok(self.mirror.last_location(agent_id))
    }

    async fn save_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        self.context()?;
        self.mirror.save_status(agent_id, status, timestamp);
        Ok(())
    }

    async fn status(&self, agent_id: &str) -> Result<Option<AgentStatus>, StorageError> {
        self.context()?;
        Ok(self.mirror.status(agent_id))
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<(), StorageError> {
        self.context()?;
        self.mirror.save_state(state);
        Ok(())
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StorageError> {
        self.context()?;
        Ok(self.mirror.state(agent_id))
    }

    async fn all_agents(&self) -> Result<Vec<String>, StorageError> {
        self.context()?;
        Ok(self.mirror.all_agents())
    }

    async fn publish_event(&self, event: &BeaconEvent) -> Result<(), StorageError> {
        let context = self.context()?;
        let subject = format!("{}.{}", self.config.subject_prefix, event.kind().as_str());
        let payload = serde_json::to_vec(event)?;

        debug!(
            event_id = %event.event_id,
            subject = %subject,
            "Publishing event to JetStream"
        );

        context
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                StorageError::Backend(format!("failed to publish to '{}': {}", subject, e))
            })?
            .await
            .map_err(|e| StorageError::Backend(format!("publish ack failed: {}", e)))?;

        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<(), StorageError> {
        let context = self.context()?;
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
        self.spawn_dispatcher(context);
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
        self.context()?;
        Ok(self.mirror.stats(agent_id))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<(), StorageError> {
        self.context()?;
        self.mirror.clear_agent(agent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_local_nats() {
        let config = JetStreamConfig::default();
        assert_eq!(config.stream_name, "BEACON_EVENTS");
        assert_eq!(config.subject_prefix, "beacon.events");
        assert_eq!(config.max_age_days, 7);
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let driver = JetStreamDriver::new(JetStreamConfig::default());
        assert!(matches!(
            driver.last_location("a").await,
            Err(StorageError::Connection(_))
        ));
    }
}
