//! Wire protocol spoken with backend audio nodes.
//!
//! Messages are JSON objects tagged by an `op` field, exchanged over a
//! persistent WebSocket per node. Outbound ops drive playback and the
//! voice handshake; inbound ops carry stats, player state, lifecycle
//! events, and node-initiated requests we answer locally.

use chorus_common::{ChannelId, GroupId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Raw voice-server credentials forwarded to the node during the
/// handshake. Mirrors the gateway's voice-server payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceServerEvent {
    pub token: String,
    pub guild_id: GroupId,
    pub endpoint: String,
}

/// Commands sent to a backend node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// Ask the node to prepare a group/channel pairing.
    #[serde(rename_all = "camelCase")]
    Connect {
        guild_id: GroupId,
        channel_id: ChannelId,
    },
    /// Confirm the session with gateway-supplied credentials.
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: GroupId,
        session_id: String,
        event: VoiceServerEvent,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: GroupId,
        track: String,
        start_time: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: GroupId },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: GroupId, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: GroupId, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: GroupId, volume: u32 },
    /// Release the group on the node.
    #[serde(rename_all = "camelCase")]
    Disconnect { guild_id: GroupId },
    /// Reply to a `validationReq`.
    #[serde(rename_all = "camelCase")]
    ValidationRes {
        guild_id: GroupId,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
        valid: bool,
    },
    /// Reply to an `isConnectedReq`.
    #[serde(rename_all = "camelCase")]
    IsConnectedRes { shard_id: u32, connected: bool },
}

impl OutboundMessage {
    /// The group this command is scoped to, if any.
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Self::Connect { guild_id, .. }
            | Self::VoiceUpdate { guild_id, .. }
            | Self::Play { guild_id, .. }
            | Self::Stop { guild_id }
            | Self::Pause { guild_id, .. }
            | Self::Seek { guild_id, .. }
            | Self::Volume { guild_id, .. }
            | Self::Disconnect { guild_id }
            | Self::ValidationRes { guild_id, .. } => Some(guild_id),
            Self::IsConnectedRes { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// CPU load as reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
}

/// Memory usage as reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
}

/// Periodic load report from a node. Absent fields mean the node has
/// not reported yet (a fresh node ranks as unloaded).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Option<MemoryStats>,
    pub cpu: Option<CpuStats>,
}

impl NodeStats {
    /// Computed load used to rank nodes, lower is better.
    ///
    /// `system_load / cores * 100`, or 0 when no stats have arrived.
    pub fn load_penalty(&self) -> f64 {
        match &self.cpu {
            Some(cpu) if cpu.cores > 0 => cpu.system_load / f64::from(cpu.cores) * 100.0,
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Position/time snapshot pushed by the node for a playing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    /// Node-side unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    pub position: u64,
}

/// Track lifecycle events, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEventKind {
    #[serde(rename_all = "camelCase")]
    TrackEndEvent { track: String, reason: String },
    #[serde(rename_all = "camelCase")]
    TrackExceptionEvent { track: String, error: String },
    #[serde(rename_all = "camelCase")]
    TrackStuckEvent { track: String, threshold_ms: u64 },
    /// Event kinds this client does not know. Reported as a warning.
    #[serde(other)]
    Unknown,
}

/// A lifecycle event scoped to a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEvent {
    pub guild_id: GroupId,
    #[serde(flatten)]
    pub kind: PlayerEventKind,
}

/// Messages received from a backend node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum InboundMessage {
    Stats(NodeStats),
    /// Node asks whether a group/channel pairing is still valid.
    #[serde(rename_all = "camelCase")]
    ValidationReq {
        guild_id: GroupId,
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },
    /// Node asks whether a shard's gateway connection is up.
    #[serde(rename_all = "camelCase")]
    IsConnectedReq { shard_id: u32 },
    /// Node asks us to forward a raw signaling payload to the gateway.
    #[serde(rename = "sendWS")]
    SendWs { message: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: GroupId,
        state: PlayerState,
    },
    Event(PlayerEvent),
    /// Ops this client does not know. Dropped with a warning.
    #[serde(other)]
    Unknown,
}

/// End reason a node reports when a track was replaced by another
/// command from this side. Callers advancing a queue ignore these.
pub const END_REASON_REPLACED: &str = "REPLACED";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn play_serializes_with_op_tag() {
        let msg = OutboundMessage::Play {
            guild_id: GroupId::from("g1"),
            track: "QAAAjQIAJFR3".into(),
            start_time: 0,
            end_time: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"op": "play", "guildId": "g1", "track": "QAAAjQIAJFR3", "startTime": 0})
        );
    }

    #[test]
    fn voice_update_carries_raw_event() {
        let msg = OutboundMessage::VoiceUpdate {
            guild_id: GroupId::from("g1"),
            session_id: "abc".into(),
            event: VoiceServerEvent {
                token: "tok".into(),
                guild_id: GroupId::from("g1"),
                endpoint: "eu1.example.com:443".into(),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "voiceUpdate");
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["event"]["endpoint"], "eu1.example.com:443");
    }

    #[test]
    fn stats_parse_and_penalty() {
        let raw = json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 2,
            "uptime": 1234,
            "cpu": {"cores": 4, "systemLoad": 0.5}
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        let InboundMessage::Stats(stats) = msg else {
            panic!("expected stats");
        };
        assert_eq!(stats.players, 3);
        assert_eq!(stats.playing_players, 2);
        assert!((stats.load_penalty() - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn penalty_is_zero_without_stats() {
        assert_eq!(NodeStats::default().load_penalty(), 0.0);
    }

    #[test]
    fn track_end_event_parses() {
        let raw = json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "g1",
            "track": "abc",
            "reason": "FINISHED"
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        let InboundMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.guild_id.as_str(), "g1");
        assert!(matches!(
            event.kind,
            PlayerEventKind::TrackEndEvent { ref reason, .. } if reason == "FINISHED"
        ));
    }

    #[test]
    fn unknown_event_kind_is_tolerated() {
        let raw = json!({
            "op": "event",
            "type": "WebSocketClosedEvent",
            "guildId": "g1",
            "code": 4006
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        let InboundMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert!(matches!(event.kind, PlayerEventKind::Unknown));
    }

    #[test]
    fn unknown_op_is_tolerated() {
        let raw = json!({"op": "somethingNew", "data": 1});
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, InboundMessage::Unknown));
    }

    #[test]
    fn send_ws_keeps_raw_payload() {
        let raw = json!({
            "op": "sendWS",
            "message": {"op": 4, "d": {"guild_id": "g1", "channel_id": null}}
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        let InboundMessage::SendWs { message } = msg else {
            panic!("expected sendWS");
        };
        assert_eq!(message["d"]["guild_id"], "g1");
    }

    #[test]
    fn validation_req_without_channel() {
        let raw = json!({"op": "validationReq", "guildId": "g1"});
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::ValidationReq { channel_id: None, .. }
        ));
    }
}
