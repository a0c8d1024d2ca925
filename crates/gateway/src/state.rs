use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::sync::{RwLock, mpsc},
    tracing::debug,
};

use {
    duet_config::DuetConfig,
    duet_store::{ConversationStore, UserDirectory},
};

use crate::{auth::Identity, presence::PresenceTracker, rooms::RoomRouter};

// ── Connected client ─────────────────────────────────────────────────────────

/// Where a connection sits between authentication and disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    InChannel,
}

/// A WebSocket client currently connected to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub identity: Identity,
    pub remote_addr: SocketAddr,
    /// Channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::UnboundedSender<String>,
    /// Channel of the most recent `join-channel` still in effect.
    pub current_channel: Option<String>,
}

impl ConnectedClient {
    pub fn new(
        conn_id: impl Into<String>,
        identity: Identity,
        remote_addr: SocketAddr,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            identity,
            remote_addr,
            sender,
            current_channel: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.current_channel.is_some() {
            ConnectionPhase::InChannel
        } else {
            ConnectionPhase::Idle
        }
    }

    /// Send a serialized JSON frame to this client.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Runtime bounds taken from [`DuetConfig`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Bound on persistence during `send-message`.
    pub storage_timeout: Duration,
    /// Bound on profile lookup before an online-list broadcast.
    pub enrichment_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&DuetConfig::default())
    }
}

impl GatewaySettings {
    pub fn from_config(config: &DuetConfig) -> Self {
        Self {
            storage_timeout: config.storage.timeout(),
            enrichment_timeout: config.presence.enrichment_timeout(),
            max_frame_bytes: config.server.max_frame_bytes,
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    /// Server version string.
    pub version: String,
    pub settings: GatewaySettings,
    pub presence: PresenceTracker,
    pub rooms: RoomRouter,
    pub store: Arc<dyn ConversationStore>,
    pub directory: Arc<dyn UserDirectory>,
}

impl GatewayState {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
            settings,
            presence: PresenceTracker::new(),
            rooms: RoomRouter::new(),
            store,
            directory,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn set_current_channel(&self, conn_id: &str, channel: Option<String>) {
        if let Some(client) = self.clients.write().await.get_mut(conn_id) {
            client.current_channel = channel;
        }
    }

    pub async fn phase(&self, conn_id: &str) -> Option<ConnectionPhase> {
        self.clients.read().await.get(conn_id).map(ConnectedClient::phase)
    }

    /// Tear down everything a closed connection owned: its registry entry,
    /// every channel subscription and its presence entry (when still current).
    /// Returns the user whose presence was dropped, if any.
    pub async fn close_client(&self, conn_id: &str) -> Option<String> {
        let client = self.remove_client(conn_id).await;
        let channels = self.rooms.leave_all(conn_id).await;
        if let Some(client) = client {
            debug!(
                conn_id,
                user_id = %client.identity.user_id,
                remote = %client.remote_addr,
                channels = channels.len(),
                "connection state released"
            );
        }
        self.presence.mark_offline(conn_id).await
    }
}
