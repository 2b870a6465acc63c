//! Session registry, join handshake, and failover orchestration.
//!
//! The manager is the owner of everything with a lifecycle: it holds
//! the node pool, the per-group session registry, the pending
//! handshake table, and the dispatch task that consumes node events
//! and internal re-homing signals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chorus_common::{new_correlation_id, ChannelId, GroupId, Result, VoiceError};
use chorus_config::{ChorusConfig, ManagerConfig, NodeConfig};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayLink, VoiceServerInfo, VoiceStateInfo};
use crate::node::{NodeConnection, NodeEvent, NodeOptions};
use crate::pool::NodePool;
use crate::protocol::{
    InboundMessage, OutboundMessage, PlayerEvent, PlayerEventKind, VoiceServerEvent,
};
use crate::session::{PlayOptions, Session, SessionEvent};

/// Node event channel depth; stats chatter never reaches this channel
/// so a modest buffer suffices.
const NODE_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Options for [`SessionManager::join`].
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Region hint for node selection.
    pub region: Option<String>,
}

/// Internal requests sessions raise back to the manager.
#[derive(Debug)]
pub(crate) enum ManagerSignal {
    SwitchNode { group_id: GroupId, leave: bool },
}

/// A join handshake awaiting its voice-server assignment. Exactly one
/// of resolved, rejected, or timed-out happens per entry.
struct PendingSession {
    channel_id: ChannelId,
    options: JoinOptions,
    node: NodeConnection,
    /// Present when re-homing an existing session instead of creating
    /// a fresh one.
    existing: Option<Session>,
    resolve: oneshot::Sender<Result<Session>>,
    correlation: String,
}

struct ManagerShared {
    config: ManagerConfig,
    pool: NodePool,
    sessions: RwLock<HashMap<GroupId, Session>>,
    pending: Mutex<HashMap<GroupId, PendingSession>>,
    gateway: Arc<dyn GatewayLink>,
    signal_tx: mpsc::UnboundedSender<ManagerSignal>,
}

/// The broker between the chat gateway and the node pool. Cheap to
/// clone; all clones share state.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    /// Build the manager, spawn its dispatch task, and open a
    /// connection to every configured node.
    pub async fn new(config: &ChorusConfig, gateway: Arc<dyn GatewayLink>) -> Self {
        let (node_tx, node_rx) = mpsc::channel(NODE_EVENT_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let manager = Self {
            shared: Arc::new(ManagerShared {
                config: config.manager.clone(),
                pool: NodePool::new(&config.pool, node_tx),
                sessions: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                gateway,
                signal_tx,
            }),
        };

        let dispatcher = manager.clone();
        tokio::spawn(dispatcher.dispatch_loop(node_rx, signal_rx));

        for node in &config.nodes {
            manager
                .shared
                .pool
                .add_node(NodeOptions::from_config(node, &config.manager))
                .await;
        }
        manager
    }

    // -- accessors ----------------------------------------------------------

    pub fn pool(&self) -> &NodePool {
        &self.shared.pool
    }

    pub async fn session(&self, group_id: &GroupId) -> Option<Session> {
        self.shared.sessions.read().await.get(group_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.shared.sessions.read().await.values().cloned().collect()
    }

    /// Register an extra node at runtime.
    pub async fn add_node(&self, node: &NodeConfig) -> NodeConnection {
        self.shared
            .pool
            .add_node(NodeOptions::from_config(node, &self.shared.config))
            .await
    }

    pub async fn remove_node(&self, key: &str) -> bool {
        self.shared.pool.remove_node(key).await
    }

    // -- join / leave -------------------------------------------------------

    /// Join a voice channel, completing the three-party handshake.
    ///
    /// A group with a live session in another channel just switches
    /// channel; the existing session is returned either way. A fresh
    /// join resolves once the gateway hands over voice-server
    /// credentials and the node has been given them, or fails with
    /// [`VoiceError::HandshakeTimeout`].
    pub async fn join(
        &self,
        group_id: GroupId,
        channel_id: ChannelId,
        options: JoinOptions,
    ) -> Result<Session> {
        if let Some(session) = self.session(&group_id).await {
            if session.channel_id().await != channel_id {
                let current = session.join_options().await;
                session.switch_channel(channel_id.clone(), false).await;
                self.shared
                    .gateway
                    .update_voice_state(
                        &group_id,
                        Some(&channel_id),
                        current.self_mute,
                        current.self_deaf,
                    )
                    .await;
            }
            return Ok(session);
        }
        self.join_inner(group_id, channel_id, options, None).await
    }

    async fn join_inner(
        &self,
        group_id: GroupId,
        channel_id: ChannelId,
        options: JoinOptions,
        existing: Option<Session>,
    ) -> Result<Session> {
        let node = self
            .shared
            .pool
            .select_node(options.region.as_deref())
            .await
            .ok_or_else(|| VoiceError::NoAvailableNode {
                region: options.region.clone(),
            })?;

        let correlation = new_correlation_id();
        let (resolve_tx, resolve_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            if pending.contains_key(&group_id) {
                return Err(VoiceError::Other(format!(
                    "join already in progress for group {group_id}"
                )));
            }
            pending.insert(
                group_id.clone(),
                PendingSession {
                    channel_id: channel_id.clone(),
                    options: options.clone(),
                    node: node.clone(),
                    existing,
                    resolve: resolve_tx,
                    correlation: correlation.clone(),
                },
            );
        }

        info!(
            group = %group_id, channel = %channel_id, node = %node.key(),
            correlation, "voice handshake started"
        );
        self.shared
            .gateway
            .update_voice_state(
                &group_id,
                Some(&channel_id),
                options.self_mute,
                options.self_deaf,
            )
            .await;
        node.send(&OutboundMessage::Connect {
            guild_id: group_id.clone(),
            channel_id,
        })
        .await;

        let timeout = Duration::from_millis(self.shared.config.handshake_timeout_ms);
        match tokio::time::timeout(timeout, resolve_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VoiceError::Disconnected(
                "handshake abandoned before resolution".into(),
            )),
            Err(_elapsed) => {
                let removed = self.shared.pending.lock().await.remove(&group_id);
                if let Some(pending) = removed {
                    // Release the slot the candidate node may have set up.
                    pending
                        .node
                        .send(&OutboundMessage::Disconnect {
                            guild_id: group_id.clone(),
                        })
                        .await;
                    warn!(
                        group = %group_id, node = %pending.node.key(),
                        correlation = %pending.correlation, "voice handshake timed out"
                    );
                } else {
                    // A resolution raced the timer; the session (if any)
                    // is registered and reachable, but this waiter lost.
                    warn!(group = %group_id, "voice handshake timed out");
                }
                Err(VoiceError::HandshakeTimeout(group_id))
            }
        }
    }

    /// Leave the group's voice channel, rejecting an in-flight
    /// handshake if one exists. No-op (returns false) when the group
    /// has neither a session nor a pending join.
    pub async fn leave(&self, group_id: &GroupId) -> bool {
        let mut acted = false;

        if let Some(pending) = self.shared.pending.lock().await.remove(group_id) {
            info!(group = %group_id, correlation = %pending.correlation,
                "leaving during handshake, rejecting pending join");
            pending
                .node
                .send(&OutboundMessage::Disconnect {
                    guild_id: group_id.clone(),
                })
                .await;
            let _ = pending.resolve.send(Err(VoiceError::Disconnected(
                "left voice channel during handshake".into(),
            )));
            self.shared
                .gateway
                .update_voice_state(group_id, None, false, false)
                .await;
            acted = true;
        }

        let session = self.shared.sessions.write().await.remove(group_id);
        if let Some(session) = session {
            info!(group = %group_id, "leaving voice channel");
            session.disconnect(None).await;
            acted = true;
        }
        acted
    }

    // -- gateway signals ----------------------------------------------------

    /// Feed a voice-server assignment in from the gateway.
    pub async fn voice_server_update(&self, info: VoiceServerInfo) {
        let pending = self.shared.pending.lock().await.remove(&info.group_id);
        let Some(pending) = pending else {
            // Refreshed credentials for a live session (endpoint moved).
            if let Some(session) = self.session(&info.group_id).await {
                debug!(group = %info.group_id, "forwarding refreshed voice server credentials");
                session.send_command(voice_update(&info)).await;
            } else {
                debug!(group = %info.group_id, "voice server assignment with no pending handshake, dropping");
            }
            return;
        };

        let session = match pending.existing {
            Some(existing) => {
                existing
                    .rebind(pending.node.clone(), pending.channel_id.clone())
                    .await;
                existing
            }
            None => Session::new(
                info.group_id.clone(),
                pending.channel_id.clone(),
                pending.node.clone(),
                pending.options.clone(),
                Arc::clone(&self.shared.gateway),
                self.shared.signal_tx.clone(),
            ),
        };
        self.shared
            .sessions
            .write()
            .await
            .insert(info.group_id.clone(), session.clone());
        session.send_command(voice_update(&info)).await;
        info!(group = %info.group_id, node = %pending.node.key(),
            correlation = %pending.correlation, "voice handshake complete");

        // Resolve after the voiceUpdate has had a chance to flush so the
        // joiner never races its first command past the handshake.
        let resolved = session;
        let resolve = pending.resolve;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            resolved.mark_ready();
            resolved.emit(SessionEvent::Ready);
            let _ = resolve.send(Ok(resolved.clone()));
        });
    }

    /// Feed a self voice-state change in from the gateway.
    pub async fn voice_state_update(&self, info: VoiceStateInfo) {
        match info.channel_id {
            None => {
                // We were removed from voice outside our control.
                let session = self.shared.sessions.write().await.remove(&info.group_id);
                if let Some(session) = session {
                    info!(group = %info.group_id, "removed from voice channel externally");
                    session.disconnect(Some("voice state cleared".into())).await;
                }
            }
            Some(channel_id) => {
                if let Some(session) = self.session(&info.group_id).await {
                    session.switch_channel(channel_id, true).await;
                }
            }
        }
    }

    /// The gateway reconnected; every session's voice state is stale
    /// and must be renegotiated.
    pub async fn gateway_ready(&self) {
        let sessions = self.sessions().await;
        if sessions.is_empty() {
            return;
        }
        info!(sessions = sessions.len(), "gateway resumed, renegotiating all sessions");
        let manager = self.clone();
        let queue = self.shared.pool.failover_queue();
        tokio::spawn(async move {
            for session in sessions {
                let manager = manager.clone();
                queue
                    .submit(Box::pin(async move {
                        manager.switch_node(session, false).await;
                    }))
                    .await;
            }
        });
    }

    // -- failover -----------------------------------------------------------

    /// Re-home a session onto the best available node, resuming
    /// playback near where it stopped. `leave` drops the voice channel
    /// first (old node unreachable) instead of politely releasing it.
    pub(crate) async fn switch_node(&self, session: Session, leave: bool) {
        if !session.begin_migration() {
            debug!(group = %session.group_id(), "migration already in flight, coalescing");
            return;
        }
        let group_id = session.group_id().clone();
        let channel_id = session.channel_id().await;
        let options = session.join_options().await;
        let (track, position) = session.resume_snapshot().await;
        let was_playing = session.is_playing();
        let old_node = session.node().await;

        self.shared.sessions.write().await.remove(&group_id);
        if leave {
            self.shared
                .gateway
                .update_voice_state(&group_id, None, false, false)
                .await;
        } else {
            old_node
                .send(&OutboundMessage::Disconnect {
                    guild_id: group_id.clone(),
                })
                .await;
        }
        session.emit(SessionEvent::Reconnecting);
        tokio::task::yield_now().await;

        match self
            .join_inner(group_id.clone(), channel_id, options, Some(session.clone()))
            .await
        {
            Ok(_) => {
                if was_playing {
                    if let Some(track) = track {
                        let start_time = position + self.shared.config.resume_offset_ms;
                        session
                            .play(&track, PlayOptions {
                                start_time,
                                end_time: None,
                            })
                            .await;
                    }
                }
                session.end_migration();
                let node_key = session.node().await.key();
                info!(group = %group_id, node = %node_key, "session re-homed");
            }
            Err(e) => {
                session.end_migration();
                warn!(group = %group_id, error = %e, "re-homing failed, dropping session");
                session.emit(SessionEvent::Disconnect {
                    reason: Some(e.to_string()),
                });
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    async fn dispatch_loop(
        self,
        mut node_rx: mpsc::Receiver<NodeEvent>,
        mut signal_rx: mpsc::UnboundedReceiver<ManagerSignal>,
    ) {
        loop {
            tokio::select! {
                event = node_rx.recv() => match event {
                    Some(event) => self.handle_node_event(event).await,
                    None => break,
                },
                signal = signal_rx.recv() => match signal {
                    Some(ManagerSignal::SwitchNode { group_id, leave }) => {
                        if let Some(session) = self.session(&group_id).await {
                            self.switch_node(session, leave).await;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn handle_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Connected { node } => {
                info!(node = %node.key(), "voice node available");
            }
            NodeEvent::Disconnected { node } => self.handle_node_outage(node).await,
            NodeEvent::Message { node, message } => {
                self.handle_node_message(node, message).await;
            }
        }
    }

    async fn handle_node_outage(&self, node: NodeConnection) {
        let key = node.key();
        let sessions = self.sessions().await;
        let mut affected = Vec::new();
        for session in sessions {
            if session.node().await.key() == key {
                affected.push(session);
            }
        }
        if affected.is_empty() {
            return;
        }
        warn!(node = %key, sessions = affected.len(), "node lost, re-homing its sessions");

        let manager = self.clone();
        let queue = self.shared.pool.failover_queue();
        tokio::spawn(async move {
            for session in affected {
                let manager = manager.clone();
                queue
                    .submit(Box::pin(async move {
                        manager.switch_node(session, true).await;
                    }))
                    .await;
            }
        });
    }

    async fn handle_node_message(&self, node: NodeConnection, message: InboundMessage) {
        match message {
            InboundMessage::ValidationReq {
                guild_id,
                channel_id,
            } => {
                let valid = match &channel_id {
                    // A group-level probe carries no channel to dispute.
                    None => true,
                    Some(channel) => self.channel_known(&guild_id, channel).await,
                };
                node.send(&OutboundMessage::ValidationRes {
                    guild_id,
                    channel_id,
                    valid,
                })
                .await;
            }
            InboundMessage::IsConnectedReq { shard_id } => {
                let connected = self.shared.gateway.is_shard_connected(shard_id);
                node.send(&OutboundMessage::IsConnectedRes {
                    shard_id,
                    connected,
                })
                .await;
            }
            InboundMessage::SendWs { message } => {
                self.relay_raw(message).await;
            }
            InboundMessage::PlayerUpdate { guild_id, state } => {
                match self.session(&guild_id).await {
                    Some(session) => session.state_update(state).await,
                    None => {
                        debug!(group = %guild_id, "player update for unknown group, dropping");
                    }
                }
            }
            InboundMessage::Event(event) => self.handle_player_event(event).await,
            // Stats never leave the connection task; Unknown is logged there.
            InboundMessage::Stats(_) | InboundMessage::Unknown => {}
        }
    }

    /// Forward a node-originated raw payload to the gateway. A voice
    /// state op clearing the channel means the node disconnected the
    /// session on its side; mirror that locally.
    async fn relay_raw(&self, payload: Value) {
        let leaves_voice = payload.get("op").and_then(Value::as_u64) == Some(4)
            && payload
                .get("d")
                .is_some_and(|d| d.get("channel_id").is_some_and(Value::is_null));
        let group_id = payload
            .get("d")
            .and_then(|d| d.get("guild_id"))
            .and_then(Value::as_str)
            .map(GroupId::from);

        self.shared.gateway.forward_raw(payload).await;

        if leaves_voice {
            if let Some(group_id) = group_id {
                let session = self.shared.sessions.write().await.remove(&group_id);
                if let Some(session) = session {
                    info!(group = %group_id, "node released the session");
                    session.emit(SessionEvent::Disconnect {
                        reason: Some("released by node".into()),
                    });
                }
            }
        }
    }

    async fn handle_player_event(&self, event: PlayerEvent) {
        let Some(session) = self.session(&event.guild_id).await else {
            debug!(group = %event.guild_id, "player event for unknown group, dropping");
            return;
        };
        match event.kind {
            PlayerEventKind::TrackEndEvent { track, reason } => {
                session.on_track_end(track, reason).await;
            }
            PlayerEventKind::TrackExceptionEvent { track, error } => {
                session.on_track_exception(track, error).await;
            }
            PlayerEventKind::TrackStuckEvent {
                track,
                threshold_ms,
            } => {
                session.on_track_stuck(track, threshold_ms).await;
            }
            PlayerEventKind::Unknown => {
                warn!(group = %event.guild_id, "unknown player event kind, dropping");
            }
        }
    }

    async fn channel_known(&self, group_id: &GroupId, channel_id: &ChannelId) -> bool {
        if let Some(session) = self.session(group_id).await {
            return session.channel_id().await == *channel_id;
        }
        self.shared
            .pending
            .lock()
            .await
            .get(group_id)
            .is_some_and(|p| p.channel_id == *channel_id)
    }
}

fn voice_update(info: &VoiceServerInfo) -> OutboundMessage {
    OutboundMessage::VoiceUpdate {
        guild_id: info.group_id.clone(),
        session_id: info.session_id.clone(),
        event: VoiceServerEvent {
            token: info.token.clone(),
            guild_id: info.group_id.clone(),
            endpoint: info.endpoint.clone(),
        },
    }
}
