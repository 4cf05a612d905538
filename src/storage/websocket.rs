//! WebSocket fan-out backend.
//!
//! Runs a small websocket server; every published event is broadcast
//! as a JSON frame to all connected clients (and to locally registered
//! handlers). Reads are served from the process-local mirror. Delivery
//! is best-effort: a slow client lags and drops frames, it never
//! stalls ingest.

use crate::error::StorageError;
use crate::event::BeaconEvent;
use crate::model::{AgentState, AgentStats, AgentStatus, LocationSample};
use crate::storage::mirror::StateMirror;
use crate::storage::{EventHandler, StorageDriver};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// WebSocket backend configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_max_clients() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_clients: default_max_clients(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// WebSocket broadcast storage driver.
pub struct WebSocketDriver {
    config: WebSocketConfig,
    mirror: StateMirror,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    broadcast_tx: broadcast::Sender<String>,
    client_count: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    connected: AtomicBool,
}

impl WebSocketDriver {
    pub fn new(config: WebSocketConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            config,
            mirror: StateMirror::new(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            broadcast_tx,
            client_count: Arc::new(AtomicUsize::new(0)),
            accept_task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection(
                "websocket driver is not initialized".to_string(),
            ))
        }
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageDriver for WebSocketDriver {
    async fn initialize(&self) -> Result<(), StorageError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                StorageError::Connection(format!(
                    "failed to bind {}: {}",
                    self.config.bind_addr, e
                ))
            })?;
        info!(addr = %self.config.bind_addr, "WebSocket backend listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let broadcast_tx = self.broadcast_tx.clone();
        let client_count = Arc::clone(&self.client_count);
        let max_clients = self.config.max_clients;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                if client_count.load(Ordering::SeqCst) >= max_clients {
                                    warn!(%addr, "Max clients reached, rejecting connection");
                                    continue;
                                }
                                let rx = broadcast_tx.subscribe();
                                let count = Arc::clone(&client_count);
                                tokio::spawn(handle_client(stream, addr, rx, count));
                            }
                            Err(e) => error!(error = %e, "Accept error"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("WebSocket backend shutting down");
                        break;
                    }
                }
            }
        });

        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(true);
        }
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.connected.store(false, Ordering::SeqCst);
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
        let json = serde_json::to_string(event)?;

        // No connected clients is fine; the send only fails when
        // there are no receivers.
        let _ = self.broadcast_tx.send(json);

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

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    mut events_rx: broadcast::Receiver<String>,
    client_count: Arc<AtomicUsize>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    client_count.fetch_add(1, Ordering::SeqCst);
    info!(%addr, "WebSocket client connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        // Inbound frames are ignored; this backend
                        // only broadcasts.
                    }
                    Some(Err(e)) => {
                        warn!(%addr, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                            warn!(%addr, error = %e, "Failed to send event frame");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%addr, skipped, "Client lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    client_count.fetch_sub(1, Ordering::SeqCst);
    debug!(%addr, "WebSocket client disconnected");
}
