//! Boundary with the chat-gateway client.
//!
//! The gateway client owns the signaling connection to the chat
//! service. chorus consumes two of its raw event kinds (voice-server
//! assignment and self voice-state changes) and sends voice-state
//! updates / raw relays back through the [`GatewayLink`] trait the
//! embedding process implements.

use async_trait::async_trait;
use chorus_common::{ChannelId, GroupId};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Outbound boundary
// ---------------------------------------------------------------------------

/// Outbound side of the gateway boundary.
///
/// Implemented by the embedding gateway client; all methods are
/// best-effort and must not block.
#[async_trait]
pub trait GatewayLink: Send + Sync {
    /// Ask the gateway to move the bot into `channel`, or out of voice
    /// entirely when `channel` is `None`.
    async fn update_voice_state(
        &self,
        group_id: &GroupId,
        channel_id: Option<&ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    );

    /// Forward a raw signaling payload verbatim.
    async fn forward_raw(&self, payload: Value);

    /// Whether the shard's gateway connection is currently up.
    fn is_shard_connected(&self, shard_id: u32) -> bool;
}

// ---------------------------------------------------------------------------
// Inbound signals
// ---------------------------------------------------------------------------

/// Voice-server assignment extracted from the gateway's raw feed.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceServerInfo {
    pub group_id: GroupId,
    /// The gateway session the credentials belong to.
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// Self voice-state change extracted from the gateway's raw feed.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceStateInfo {
    pub group_id: GroupId,
    /// `None` means the bot left voice in this group.
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
}

/// The gateway signal kinds this system reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewaySignal {
    VoiceServer(VoiceServerInfo),
    VoiceState(VoiceStateInfo),
}

impl GatewaySignal {
    /// Extract a signal from a raw gateway dispatch event.
    ///
    /// Expects the usual `{"t": <name>, "d": {...}}` envelope. For
    /// voice-state events, `self_user_id` filters out other users'
    /// state changes; pass the bot's own user id. Returns `None` for
    /// anything this system does not consume.
    pub fn from_raw(event: &Value, self_user_id: &str) -> Option<Self> {
        let kind = event.get("t")?.as_str()?;
        let data = event.get("d")?;
        match kind {
            "VOICE_SERVER_UPDATE" => Some(Self::VoiceServer(VoiceServerInfo {
                group_id: GroupId::new(data.get("guild_id")?.as_str()?),
                session_id: data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                token: data.get("token")?.as_str()?.to_string(),
                endpoint: data.get("endpoint")?.as_str()?.to_string(),
            })),
            "VOICE_STATE_UPDATE" => {
                let user_id = data.get("user_id")?.as_str()?;
                if user_id != self_user_id {
                    return None;
                }
                Some(Self::VoiceState(VoiceStateInfo {
                    group_id: GroupId::new(data.get("guild_id")?.as_str()?),
                    channel_id: data
                        .get("channel_id")
                        .and_then(Value::as_str)
                        .map(ChannelId::new),
                    session_id: data
                        .get("session_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// [`GatewayLink`] stub recording every outbound call.
    pub(crate) struct RecordingGateway {
        pub(crate) voice_states: Mutex<Vec<(GroupId, Option<ChannelId>, bool, bool)>>,
        pub(crate) raw: Mutex<Vec<Value>>,
        pub(crate) shard_connected: AtomicBool,
    }

    impl Default for RecordingGateway {
        fn default() -> Self {
            Self {
                voice_states: Mutex::new(Vec::new()),
                raw: Mutex::new(Vec::new()),
                shard_connected: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl GatewayLink for RecordingGateway {
        async fn update_voice_state(
            &self,
            group_id: &GroupId,
            channel_id: Option<&ChannelId>,
            self_mute: bool,
            self_deaf: bool,
        ) {
            self.voice_states.lock().await.push((
                group_id.clone(),
                channel_id.cloned(),
                self_mute,
                self_deaf,
            ));
        }

        async fn forward_raw(&self, payload: Value) {
            self.raw.lock().await.push(payload);
        }

        fn is_shard_connected(&self, _shard_id: u32) -> bool {
            self.shard_connected.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_voice_server_update() {
        let raw = json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": {
                "guild_id": "g1",
                "token": "tok",
                "endpoint": "eu1.example.com:443",
                "session_id": "sess"
            }
        });
        let signal = GatewaySignal::from_raw(&raw, "bot").unwrap();
        let GatewaySignal::VoiceServer(info) = signal else {
            panic!("expected voice server signal");
        };
        assert_eq!(info.group_id.as_str(), "g1");
        assert_eq!(info.token, "tok");
        assert_eq!(info.endpoint, "eu1.example.com:443");
    }

    #[test]
    fn extracts_self_voice_state_only() {
        let raw = json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "g1",
                "channel_id": "c2",
                "user_id": "bot",
                "session_id": "sess"
            }
        });
        let signal = GatewaySignal::from_raw(&raw, "bot").unwrap();
        assert!(matches!(
            signal,
            GatewaySignal::VoiceState(VoiceStateInfo { ref channel_id, .. })
                if channel_id.as_ref().map(ChannelId::as_str) == Some("c2")
        ));

        // Another user's state change is not ours to react to.
        assert!(GatewaySignal::from_raw(&raw, "someone-else").is_none());
    }

    #[test]
    fn null_channel_means_left_voice() {
        let raw = json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "g1",
                "channel_id": null,
                "user_id": "bot",
                "session_id": "sess"
            }
        });
        let signal = GatewaySignal::from_raw(&raw, "bot").unwrap();
        let GatewaySignal::VoiceState(info) = signal else {
            panic!("expected voice state signal");
        };
        assert!(info.channel_id.is_none());
    }

    #[test]
    fn ignores_unrelated_events() {
        let raw = json!({"t": "MESSAGE_CREATE", "d": {"content": "hi"}});
        assert!(GatewaySignal::from_raw(&raw, "bot").is_none());
    }
}
