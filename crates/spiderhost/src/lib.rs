//! Spiderhost
//!
//! Process-level services around the script runtime:
//! - Host configuration (TOML)
//! - Native plugin download cache and dynamic library loading
//! - Spider registry with proxy correlation
//! - HTTP proxy relay for media players

// Configuration file
pub mod config;

// Native plugin cache
pub mod plugin;

// Live spiders
pub mod registry;

// Proxy relay server
pub mod server;

pub use config::{ConfigError, HostConfig, SiteConfig};
pub use registry::{RegistryError, SpiderRegistry};
