//! Broadcast hub and viewer session lifecycle.
//!
//! Every viewer is one WebSocket with a bounded outbox channel. The hub
//! fans push messages out to all registered viewers; a send failure
//! removes that viewer without affecting delivery to the rest.

use crate::state::PipelineStore;
use crate::watcher::EchoGuard;
use crate::Config;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vault_core::protocol::PushMessage;

const OUTBOX_CAPACITY: usize = 256;

pub(crate) struct Client {
    pub(crate) conn_id: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    pub(crate) fn new(conn_id: String, sender: mpsc::Sender<Message>) -> Self {
        Client { conn_id, sender }
    }

    async fn send_text(&self, text: &str) -> bool {
        self.sender
            .send(Message::Text(text.to_string()))
            .await
            .is_ok()
    }
}

pub struct HubState {
    pub config: Config,
    pub store: PipelineStore,
    pub echo: EchoGuard,
    /// Serializes mutation operations across their filesystem work and
    /// store update, so a move's rename and recovery never interleave
    /// with another mutation.
    pub(crate) mutations: Mutex<()>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        let store = PipelineStore::new(config.activity_cap);
        let echo = EchoGuard::new(config.debounce * 4);
        HubState {
            config,
            store,
            echo,
            mutations: Mutex::new(()),
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("viewer-{id}")
    }

    pub(crate) async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "viewer_connected", conn_id = %client.conn_id);
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        if self.clients.write().await.remove(&client.conn_id).is_some() {
            info!(event = "viewer_disconnected", conn_id = %client.conn_id, reason = reason);
        }
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn viewer_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Send one push message to every connected viewer. A dead viewer is
    /// dropped from the set; the others still get the message.
    pub async fn broadcast(&self, message: &PushMessage) {
        let text = match serde_json::to_string(message) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", error = %err);
                return;
            }
        };
        for client in self.snapshot_clients().await {
            if !client.send_text(&text).await {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client, "send_error").await;
            }
        }
    }

    /// Periodic full-snapshot refresh, independent of change delivery.
    pub fn start_refresh(self: Arc<Self>) {
        let interval = self.config.update_interval;
        if interval.is_zero() {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if hub.viewer_count().await == 0 {
                    continue;
                }
                let snapshot = hub.store.snapshot().await;
                hub.broadcast(&PushMessage::SystemUpdate { data: snapshot })
                    .await;
            }
        });
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        let hub = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    hub.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        }))
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    // Timed out or the socket is gone; stop draining so
                    // the outbox closes and the ping task can follow.
                    _ => return,
                }
            }
        });

        let client = Arc::new(Client::new(self.next_conn_id(), tx.clone()));

        // The snapshot goes into the outbox before the client joins the
        // broadcast set, so the first message a viewer reads is always
        // the full state.
        let snapshot = self.store.snapshot().await;
        let initial = PushMessage::InitialState { data: snapshot };
        match serde_json::to_string(&initial) {
            Ok(text) => {
                if !client.send_text(&text).await {
                    warn!(event = "snapshot_error", conn_id = %client.conn_id);
                    return;
                }
            }
            Err(err) => {
                warn!(event = "encode_error", error = %err);
                return;
            }
        }
        self.register_client(client.clone()).await;
        let ping_task = self.clone().start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            match msg {
                Message::Close(_) => {
                    info!(event = "viewer_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                // Viewers mutate through the HTTP surface; inbound
                // socket payloads carry no protocol meaning.
                Message::Text(_) | Message::Binary(_) => {
                    debug!(event = "viewer_message_ignored", conn_id = %client.conn_id);
                }
            }
        }

        self.remove_client(&client, "disconnect").await;
        // Cancel the heartbeat and release every outbox sender; the
        // write task then drains its queue and exits.
        if let Some(task) = ping_task {
            task.abort();
        }
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket).await;
    })
}
