//! Native Plugins
//!
//! Downloads, caches and loads the native plugin a spider references
//! through its `jar` setting.

mod cache;
mod dylib;

pub use cache::{JarSpec, PluginCache, PluginCacheOptions, PluginMaterializer};
pub use dylib::{DylibMaterializer, DylibPlugin};

/// Errors from fetching or loading a plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Download returned status {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load plugin library: {0}")]
    Load(String),

    #[error("Plugin ABI version {found} does not match host version {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("Invalid plugin descriptor: {0}")]
    Descriptor(String),
}
