pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{default_config_path, load_default, load_from_path};
pub use schema::{ChorusConfig, ManagerConfig, NodeConfig, PoolConfig, CONFIG_SCHEMA_VERSION};
