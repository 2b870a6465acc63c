//! Voice-session broker between a chat gateway and a pool of audio
//! backend nodes.
//!
//! The embedding process implements [`GatewayLink`], feeds raw gateway
//! dispatches through [`GatewaySignal::from_raw`] into the
//! [`SessionManager`], and drives playback through the [`Session`]
//! handles `join` returns. Node outages and gateway resumes re-home
//! sessions automatically, paced by the pool's failover queue.

pub mod gateway;
pub mod manager;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod session;

pub use gateway::{GatewayLink, GatewaySignal, VoiceServerInfo, VoiceStateInfo};
pub use manager::{JoinOptions, SessionManager};
pub use node::{ConnectionState, NodeConnection, NodeEvent, NodeOptions};
pub use pool::{FailoverQueue, NodePool};
pub use protocol::{InboundMessage, NodeStats, OutboundMessage, PlayerState};
pub use session::{PlayOptions, Session, SessionEvent};
