//! Proxy configuration: Server list, per-server settings, global settings.
//!
//! - `types`: serde model of the config file
//! - `loader`: path discovery, parsing, `${VAR}` expansion, validation
//! - `errors`: configuration error taxonomy

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::ConfigError;
pub use loader::{find_config_path, load_config, parse_config, ConfigFormat};
pub use types::{GlobalSettings, ProxyConfig, ServerConfig, ServerSettings, ServerType};
