//! Persistent connection to one backend audio node.
//!
//! Each node gets a [`NodeConnection`] handle backed by a background
//! WebSocket task with reconnect backoff. Handles are cheap clones;
//! the pool, sessions, and the manager all hold the same connection.

mod connection;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chorus_config::{ManagerConfig, NodeConfig};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use crate::protocol::{InboundMessage, NodeStats, OutboundMessage};

pub(crate) use connection::reconnect_delay;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Connection parameters for one node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub host: String,
    pub port: u16,
    /// Credential sent in the `Authorization` header.
    pub password: String,
    /// Region hint used by pool selection.
    pub region: Option<String>,
    /// Sent in the `Num-Shards` header.
    pub shard_count: u32,
    /// Bot identity sent in the `User-Id` header.
    pub user_id: String,
}

impl NodeOptions {
    pub fn from_config(node: &NodeConfig, manager: &ManagerConfig) -> Self {
        Self {
            host: node.host.clone(),
            port: node.port,
            password: node.password.clone(),
            region: node.region.clone(),
            shard_count: manager.shard_count,
            user_id: manager.user_id.clone(),
        }
    }

    /// Unique key a node is registered under in the pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Lifecycle of a node socket.
///
/// `Draining` means the node is still connected but shedding load: it
/// receives no new sessions and existing ones migrate away on contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Notifications emitted by a node connection.
#[derive(Clone)]
pub enum NodeEvent {
    /// Socket opened (first connect or reconnect).
    Connected { node: NodeConnection },
    /// Socket closed while connected. Emitted once per outage, not on
    /// failed reconnect attempts.
    Disconnected { node: NodeConnection },
    /// Any inbound message other than a stats report.
    Message {
        node: NodeConnection,
        message: InboundMessage,
    },
}

impl fmt::Debug for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { node } => write!(f, "Connected({})", node.key()),
            Self::Disconnected { node } => write!(f, "Disconnected({})", node.key()),
            Self::Message { node, message } => {
                write!(f, "Message({}, {message:?})", node.key())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

pub(crate) enum NodeCommand {
    Send(String),
    Destroy,
}

pub(crate) struct NodeShared {
    pub(crate) options: NodeOptions,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) stats: RwLock<NodeStats>,
    pub(crate) retry_count: AtomicU32,
    cmd_tx: mpsc::UnboundedSender<NodeCommand>,
    cmd_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<NodeCommand>>>,
}

/// Handle to one node's persistent connection.
#[derive(Clone)]
pub struct NodeConnection {
    shared: Arc<NodeShared>,
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("key", &self.key())
            .finish()
    }
}

impl NodeConnection {
    pub fn new(options: NodeOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(NodeShared {
                options,
                state: RwLock::new(ConnectionState::Disconnected),
                stats: RwLock::new(NodeStats::default()),
                retry_count: AtomicU32::new(0),
                cmd_tx,
                cmd_rx: std::sync::Mutex::new(Some(cmd_rx)),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<NodeShared>) -> Self {
        Self { shared }
    }

    pub fn key(&self) -> String {
        self.shared.options.key()
    }

    pub fn region(&self) -> Option<&str> {
        self.shared.options.region.as_deref()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Latest load report, zeroed until the node sends one.
    pub async fn stats(&self) -> NodeStats {
        self.shared.stats.read().await.clone()
    }

    /// Open the socket and keep it open. The background task reports
    /// lifecycle and messages on `events`. Calling this twice is a
    /// no-op.
    pub fn connect(&self, events: mpsc::Sender<NodeEvent>) {
        let rx = self.shared.cmd_rx.lock().expect("cmd_rx lock").take();
        let Some(cmd_rx) = rx else {
            warn!(node = %self.key(), "connect called on a running connection");
            return;
        };
        tokio::spawn(connection::connection_loop(
            Arc::clone(&self.shared),
            cmd_rx,
            events,
        ));
    }

    /// Serialize and transmit a command. Silently dropped when the
    /// socket is absent; callers needing ordering must queue
    /// themselves (see `Session`).
    pub async fn send(&self, message: &OutboundMessage) {
        let state = self.state().await;
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Draining
        ) {
            debug!(node = %self.key(), ?state, "socket absent, dropping command");
            return;
        }
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.shared.cmd_tx.send(NodeCommand::Send(json));
            }
            Err(e) => {
                error!(node = %self.key(), error = %e, "failed to serialize command, dropping");
            }
        }
    }

    /// Close the socket and stop the background task without reconnect.
    pub fn destroy(&self) {
        let _ = self.shared.cmd_tx.send(NodeCommand::Destroy);
    }

    /// Mark a connected node as shedding load. New sessions avoid it
    /// and existing ones migrate away on their next play.
    pub async fn mark_draining(&self) {
        let mut state = self.shared.state.write().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Draining;
        }
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    #[cfg(test)]
    pub(crate) fn take_command_rx(&self) -> mpsc::UnboundedReceiver<NodeCommand> {
        self.shared
            .cmd_rx
            .lock()
            .expect("cmd_rx lock")
            .take()
            .expect("command receiver already taken")
    }

    #[cfg(test)]
    pub(crate) async fn set_stats(&self, stats: NodeStats) {
        *self.shared.stats.write().await = stats;
    }
}
