//! Host Configuration
//!
//! The TOML file read at startup. Every field has a default, so an absent
//! file or section is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spiderhost_js_runtime::{CallTimeouts, EngineLimits};

/// Errors loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Host configuration (spiderhost.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub plugins: PluginSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

/// Engine and registry limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub call_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub init_timeout_ms: u64,
    /// 0 = unlimited
    pub memory_limit_mb: usize,
    pub max_stack_kb: usize,
    pub max_live_spiders: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            dispatch_timeout_ms: 35_000,
            init_timeout_ms: 60_000,
            memory_limit_mb: 0,
            max_stack_kb: 1024,
            max_live_spiders: 16,
        }
    }
}

impl RuntimeSection {
    pub fn timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            call: Duration::from_millis(self.call_timeout_ms),
            dispatch: Duration::from_millis(self.dispatch_timeout_ms),
            init: Duration::from_millis(self.init_timeout_ms),
        }
    }

    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            memory_bytes: self.memory_limit_mb * 1024 * 1024,
            stack_bytes: self.max_stack_kb * 1024,
        }
    }
}

/// Native plugin cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub cache_dir: PathBuf,
    pub stale_after_hours: u64,
    pub load_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("spiderhost"),
            stale_after_hours: 168,
            load_attempts: 5,
            retry_delay_ms: 200,
        }
    }
}

impl PluginSection {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_hours * 3600)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Proxy server address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9978,
        }
    }
}

impl ServerSection {
    /// Base address spiders embed in proxy URLs.
    pub fn proxy_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A configured spider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub key: String,
    pub api: String,
    #[serde(default)]
    pub ext: Option<String>,
    /// Native plugin reference, `url;md5;hash`
    #[serde(default)]
    pub jar: Option<String>,
}

impl HostConfig {
    /// Load from `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn site(&self, key: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|site| site.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::parse("").unwrap();
        assert_eq!(config.runtime.timeouts(), CallTimeouts::default());
        assert_eq!(config.runtime.max_live_spiders, 16);
        assert_eq!(config.plugins.stale_after(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.plugins.load_attempts, 5);
        assert_eq!(config.server.proxy_base(), "http://127.0.0.1:9978");
        assert!(config.sites.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = HostConfig::parse(
            r#"
            [runtime]
            call_timeout_ms = 1000
            memory_limit_mb = 64

            [server]
            port = 8080

            [[sites]]
            key = "demo"
            api = "https://example.com/demo.js"
            ext = '{"token":"t"}'
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.timeouts().call, Duration::from_secs(1));
        assert_eq!(config.runtime.timeouts().dispatch, Duration::from_secs(35));
        assert_eq!(config.runtime.limits().memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.server.proxy_base(), "http://127.0.0.1:8080");
        let site = config.site("demo").unwrap();
        assert_eq!(site.ext.as_deref(), Some(r#"{"token":"t"}"#));
        assert_eq!(site.jar, None);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 9978);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[runtime\n").unwrap();
        assert!(matches!(HostConfig::load(&bad), Err(ConfigError::Parse { .. })));
    }
}
