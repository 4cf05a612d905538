//! MQTT broker backend.
//!
//! Events travel through a message broker at QoS 1 (at-least-once,
//! broker-acknowledged). The broker carries only the event fabric;
//! reads are served from the process-local mirror.

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::storage::mirror::StateMirror;
use crate::storage::{EventHandler, StorageDriver};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// MQTT backend configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "beacon-engine".to_string()
}

fn default_topic_prefix() -> String {
    "beacon/events".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Queue-broker storage driver over MQTT.
pub struct MqttDriver {
    config: MqttConfig,
    client: RwLock<Option<AsyncClient>>,
    mirror: StateMirror,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    eventloop_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttDriver {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            mirror: StateMirror::new(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            eventloop_task: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, StorageError> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| StorageError::Connection("mqtt driver is not initialized".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn event_topic(&self, event: &BeaconEvent) -> String {
        format!("{}/{}", self.config.topic_prefix, event.kind().as_str())
    }
}

#[async_trait]
impl StorageDriver for MqttDriver {
    async fn initialize(&self) -> Result<(), StorageError> {
        info!(
            broker = %self.config.broker,
            port = self.config.port,
            "Connecting to MQTT broker"
        );

        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker,
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // One task drives the connection and dispatches inbound
        // events to registered handlers.
        let handlers = Arc::clone(&self.handlers);
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<BeaconEvent>(&publish.payload) {
                            Ok(event) => {
                                let handlers =
                                    handlers.read().unwrap_or_else(|e| e.into_inner());
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
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "Dropping undecodable event")
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        client
            .subscribe(format!("{}/#", self.config.topic_prefix), QoS::AtLeastOnce)
            .await
            .map_err(|e| StorageError::Connection(format!("mqtt subscribe failed: {}", e)))?;

        *self.eventloop_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let client = self
            .client
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "MQTT disconnect failed");
            }
        }
        if let Some(task) = self
            .eventloop_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
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
        self.client()?;
        self.mirror.save_location(agent_id, sample);
        Ok(())
    }

    async fn last_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, StorageError> {
        self.client()?;
        Ok(self.mirror.last_location(agent_id))
    }

    async fn save_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        self.client()?;
        self.mirror.save_status(agent_id, status, timestamp);
        Ok(())
    }

    async fn status(&self, agent_id: &str) -> Result<Option<AgentStatus>, StorageError> {
        self.client()?;
        Ok(self.mirror.status(agent_id))
    }

    async fn save_agent_state(&self, state: &AgentState) -> Result<(), StorageError> {
        self.client()?;
        self.mirror.save_state(state);
        Ok(())
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StorageError> {
        self.client()?;
        Ok(self.mirror.state(agent_id))
    }

    async fn all_agents(&self) -> Result<Vec<String>, StorageError> {
        self.client()?;
        Ok(self.mirror.all_agents())
    }

    async fn publish_event(&self, event: &BeaconEvent) -> Result<(), StorageError> {
        let client = self.client()?;
        let topic = self.event_topic(event);
        let payload = serde_json::to_vec(event)?;

        debug!(event_id = %event.event_id, topic = %topic, "Publishing event to MQTT");

        client
            .publish(topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| StorageError::Backend(format!("mqtt publish to '{}' failed: {}", topic, e)))?;
        Ok(())
    }

    async fn subscribe_events(&self, handler: EventHandler) -> Result<(), StorageError> {
        self.client()?;
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
        self.client()?;
        Ok(self.mirror.stats(agent_id))
    }

    async fn clear_agent_data(&self, agent_id: &str) -> Result<(), StorageError> {
        self.client()?;
        self.mirror.clear_agent(agent_id);
        Ok(())
    }
}
