pub mod errors;
pub mod id;

pub use errors::{ConfigError, VoiceError};
pub use id::{new_correlation_id, ChannelId, GroupId};

pub type Result<T> = std::result::Result<T, VoiceError>;
