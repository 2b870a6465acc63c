//! Per-group playback session.
//!
//! A session owns the ordered outbound command queue for its group and
//! is bound to exactly one node at a time; the manager rebinds it
//! during failover. Lifecycle notifications fan out over a broadcast
//! channel so subscribers survive re-homing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chorus_common::{ChannelId, GroupId};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::gateway::GatewayLink;
use crate::manager::{JoinOptions, ManagerSignal};
use crate::node::{ConnectionState, NodeConnection};
use crate::protocol::{OutboundMessage, PlayerState, END_REASON_REPLACED};

/// Sent commands kept for diagnostics.
const COMMAND_HISTORY: usize = 16;

/// Capacity of the per-session event channel.
const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Playback options for [`Session::play`].
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Start position in milliseconds.
    pub start_time: u64,
    /// Optional end position in milliseconds.
    pub end_time: Option<u64>,
}

/// Lifecycle notifications observable on a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The join handshake completed; playback commands flow now.
    Ready,
    /// A track stopped. `may_start_next` is false when the end was
    /// caused by this side replacing the track; queue-advancing
    /// callers ignore those.
    End {
        track: Option<String>,
        reason: String,
        may_start_next: bool,
    },
    /// The node reported a playback exception.
    Error {
        track: Option<String>,
        error: String,
    },
    /// The node reported a stuck track; an `End` follows.
    Stuck {
        track: Option<String>,
        threshold_ms: u64,
    },
    /// The session was torn down, possibly with an originating error.
    Disconnect { reason: Option<String> },
    /// The session is being re-homed to another node.
    Reconnecting,
}

#[derive(Default)]
struct TrackState {
    current: Option<String>,
    last: Option<String>,
    /// Wall-clock start of the current track, unix ms.
    started_at: u64,
}

pub(crate) struct SessionShared {
    group_id: GroupId,
    channel_id: RwLock<ChannelId>,
    node: RwLock<NodeConnection>,
    options: RwLock<JoinOptions>,
    ready: AtomicBool,
    playing: AtomicBool,
    paused: AtomicBool,
    /// Set while the manager re-homes this session; coalesces
    /// overlapping migrations and swallows the forced-stop end event.
    migrating: AtomicBool,
    volume: AtomicU32,
    track: Mutex<TrackState>,
    last_state: Mutex<PlayerState>,
    queue: Mutex<VecDeque<OutboundMessage>>,
    history: Mutex<VecDeque<OutboundMessage>>,
    events: broadcast::Sender<SessionEvent>,
    gateway: Arc<dyn GatewayLink>,
    signal_tx: mpsc::UnboundedSender<ManagerSignal>,
    created_at: DateTime<Utc>,
}

/// Handle to one group's playback session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("group_id", &self.shared.group_id)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        group_id: GroupId,
        channel_id: ChannelId,
        node: NodeConnection,
        options: JoinOptions,
        gateway: Arc<dyn GatewayLink>,
        signal_tx: mpsc::UnboundedSender<ManagerSignal>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SessionShared {
                group_id,
                channel_id: RwLock::new(channel_id),
                node: RwLock::new(node),
                options: RwLock::new(options),
                ready: AtomicBool::new(false),
                playing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                migrating: AtomicBool::new(false),
                volume: AtomicU32::new(100),
                track: Mutex::new(TrackState::default()),
                last_state: Mutex::new(PlayerState::default()),
                queue: Mutex::new(VecDeque::new()),
                history: Mutex::new(VecDeque::new()),
                events,
                gateway,
                signal_tx,
                created_at: Utc::now(),
            }),
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn group_id(&self) -> &GroupId {
        &self.shared.group_id
    }

    pub async fn channel_id(&self) -> ChannelId {
        self.shared.channel_id.read().await.clone()
    }

    pub async fn node(&self) -> NodeConnection {
        self.shared.node.read().await.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Last volume set through [`Session::set_volume`], percent.
    pub fn volume(&self) -> u32 {
        self.shared.volume.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Track currently playing, if any.
    pub async fn track(&self) -> Option<String> {
        self.shared.track.lock().await.current.clone()
    }

    /// Last node-reported position/time snapshot.
    pub async fn last_state(&self) -> PlayerState {
        *self.shared.last_state.lock().await
    }

    /// Unix-ms timestamp of the last play command, 0 before any.
    pub async fn track_started_at(&self) -> u64 {
        self.shared.track.lock().await.started_at
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) async fn join_options(&self) -> JoinOptions {
        self.shared.options.read().await.clone()
    }

    // -- command queue ------------------------------------------------------

    /// Enqueue a command for the bound node.
    ///
    /// When the queue is idle the command goes out immediately and a
    /// drain runs on the next scheduling opportunity; otherwise it is
    /// appended. Delivery order always equals submission order.
    pub(crate) async fn send_command(&self, command: OutboundMessage) {
        let mut queue = self.shared.queue.lock().await;
        if !queue.is_empty() {
            queue.push_back(command);
            return;
        }
        // Transmit under the queue lock so concurrent senders stay ordered.
        self.transmit(command).await;
        drop(queue);

        let session = self.clone();
        tokio::spawn(async move {
            session.drain_queue().await;
        });
    }

    async fn transmit(&self, command: OutboundMessage) {
        let node = self.shared.node.read().await.clone();
        node.send(&command).await;
        let mut history = self.shared.history.lock().await;
        if history.len() == COMMAND_HISTORY {
            history.pop_front();
        }
        history.push_back(command);
    }

    async fn drain_queue(&self) {
        loop {
            let next = self.shared.queue.lock().await.pop_front();
            let Some(command) = next else { break };
            self.transmit(command).await;
            tokio::task::yield_now().await;
        }
    }

    // -- playback -----------------------------------------------------------

    /// Start (or replace) playback of an opaque track token.
    ///
    /// A draining node gets no play command; position tracking resets
    /// and the session asks the manager to re-home it instead.
    pub async fn play(&self, track: &str, options: PlayOptions) {
        let node = self.node().await;
        if node.state().await == ConnectionState::Draining {
            debug!(group = %self.shared.group_id, node = %node.key(),
                "bound node is draining, requesting re-home instead of play");
            {
                let mut state = self.shared.last_state.lock().await;
                state.position = options.start_time;
            }
            {
                let mut tracks = self.shared.track.lock().await;
                tracks.current = Some(track.to_string());
            }
            self.shared.playing.store(true, Ordering::Release);
            let _ = self.shared.signal_tx.send(ManagerSignal::SwitchNode {
                group_id: self.shared.group_id.clone(),
                leave: false,
            });
            return;
        }

        self.send_command(OutboundMessage::Play {
            guild_id: self.shared.group_id.clone(),
            track: track.to_string(),
            start_time: options.start_time,
            end_time: options.end_time,
        })
        .await;

        {
            let mut tracks = self.shared.track.lock().await;
            tracks.current = Some(track.to_string());
            tracks.started_at = Utc::now().timestamp_millis() as u64;
        }
        self.shared.playing.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Stop playback, retaining the stopped track for resume.
    pub async fn stop(&self) {
        self.send_command(OutboundMessage::Stop {
            guild_id: self.shared.group_id.clone(),
        })
        .await;
        self.shared.playing.store(false, Ordering::Release);
        let mut tracks = self.shared.track.lock().await;
        if let Some(current) = tracks.current.take() {
            tracks.last = Some(current);
        }
    }

    pub async fn pause(&self, pause: bool) {
        self.send_command(OutboundMessage::Pause {
            guild_id: self.shared.group_id.clone(),
            pause,
        })
        .await;
        self.shared.paused.store(pause, Ordering::Release);
    }

    pub async fn seek(&self, position: u64) {
        self.send_command(OutboundMessage::Seek {
            guild_id: self.shared.group_id.clone(),
            position,
        })
        .await;
        self.shared.last_state.lock().await.position = position;
    }

    /// Volume in percent, 0-1000.
    pub async fn set_volume(&self, volume: u32) {
        self.send_command(OutboundMessage::Volume {
            guild_id: self.shared.group_id.clone(),
            volume,
        })
        .await;
        self.shared.volume.store(volume, Ordering::Release);
    }

    /// Move to another channel. `reactive` changes originated outside
    /// (an operator moved the bot); those also push a voice-state
    /// signal so the gateway's view stays consistent.
    pub async fn switch_channel(&self, channel_id: ChannelId, reactive: bool) {
        {
            let mut current = self.shared.channel_id.write().await;
            if *current == channel_id {
                return;
            }
            *current = channel_id.clone();
        }
        if reactive {
            let options = self.join_options().await;
            self.shared
                .gateway
                .update_voice_state(
                    &self.shared.group_id,
                    Some(&channel_id),
                    options.self_mute,
                    options.self_deaf,
                )
                .await;
        }
    }

    /// Tear the session down: release the group on the node, leave the
    /// voice channel, and notify subscribers. Registry removal is the
    /// manager's job.
    pub(crate) async fn disconnect(&self, reason: Option<String>) {
        self.send_command(OutboundMessage::Disconnect {
            guild_id: self.shared.group_id.clone(),
        })
        .await;
        self.shared
            .gateway
            .update_voice_state(&self.shared.group_id, None, false, false)
            .await;
        self.shared.playing.store(false, Ordering::Release);
        self.shared.ready.store(false, Ordering::Release);
        self.emit(SessionEvent::Disconnect { reason });
    }

    // -- inbound from the node ----------------------------------------------

    /// Replace the last known state, last writer wins.
    pub(crate) async fn state_update(&self, state: PlayerState) {
        *self.shared.last_state.lock().await = state;
    }

    pub(crate) async fn on_track_end(&self, track: String, reason: String) {
        self.shared.playing.store(false, Ordering::Release);
        {
            let mut tracks = self.shared.track.lock().await;
            if let Some(current) = tracks.current.take() {
                tracks.last = Some(current);
            }
        }
        if self.is_migrating() {
            // The forced stop during re-homing is not a real completion.
            debug!(group = %self.shared.group_id, reason, "suppressing end event during migration");
            return;
        }
        let may_start_next = reason != END_REASON_REPLACED;
        self.emit(SessionEvent::End {
            track: Some(track),
            reason,
            may_start_next,
        });
    }

    pub(crate) async fn on_track_exception(&self, track: String, error: String) {
        warn!(group = %self.shared.group_id, error, "track exception");
        self.emit(SessionEvent::Error {
            track: Some(track),
            error,
        });
    }

    /// A stuck track is treated as an end-of-track condition: force a
    /// stop, then surface the end on the next scheduling opportunity.
    pub(crate) async fn on_track_stuck(&self, track: String, threshold_ms: u64) {
        warn!(group = %self.shared.group_id, threshold_ms, "track stuck, forcing stop");
        self.emit(SessionEvent::Stuck {
            track: Some(track.clone()),
            threshold_ms,
        });
        self.stop().await;

        let session = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            session.emit(SessionEvent::End {
                track: Some(track),
                reason: "STUCK".into(),
                may_start_next: true,
            });
        });
    }

    // -- manager plumbing ----------------------------------------------------

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.shared.events.send(event);
    }

    pub(crate) fn mark_ready(&self) {
        self.shared.ready.store(true, Ordering::Release);
    }

    /// Rebind to a new node/channel during handshake resolution.
    pub(crate) async fn rebind(&self, node: NodeConnection, channel_id: ChannelId) {
        *self.shared.node.write().await = node;
        *self.shared.channel_id.write().await = channel_id;
    }

    /// Claim the migration flag. False when a migration is already in
    /// flight; overlapping attempts coalesce.
    pub(crate) fn begin_migration(&self) -> bool {
        !self.shared.migrating.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_migration(&self) {
        self.shared.migrating.store(false, Ordering::Release);
    }

    pub(crate) fn is_migrating(&self) -> bool {
        self.shared.migrating.load(Ordering::Acquire)
    }

    /// What re-homing needs to restore playback: the active (or last)
    /// track and the position to resume from.
    pub(crate) async fn resume_snapshot(&self) -> (Option<String>, u64) {
        let tracks = self.shared.track.lock().await;
        let track = tracks.current.clone().or_else(|| {
            if self.is_playing() {
                tracks.last.clone()
            } else {
                None
            }
        });
        let position = self.shared.last_state.lock().await.position;
        (track, position)
    }

    #[cfg(test)]
    pub(crate) async fn queued_commands(&self) -> usize {
        self.shared.queue.lock().await.len()
    }
}
