//! Configuration types and loading
//!
//! Configuration is loaded from JSON files and can be overridden by
//! environment variables at startup.

mod loader;
mod types;

pub use loader::{
    apply_env, create_default_config, load_config, load_config_str, load_config_with_env,
};
pub use types::{BypassConfig, Config, LogConfig, ProtocolKind, ServerConfig};
