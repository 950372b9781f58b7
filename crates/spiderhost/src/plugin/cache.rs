//! Plugin Class Cache
//!
//! One record per plugin URL, keyed by the MD5 of the URL. Files live under
//! `<cache_dir>/csp/<key>.<dll extension>` and are refetched when a pinned
//! hash no longer matches, or when unpinned and older than the staleness
//! window.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use md5::{Digest, Md5};
use spiderhost_plugin_api::NativePlugin;
use tokio::io::AsyncWriteExt;

use super::PluginError;

/// Turns a cached plugin file into a loaded plugin.
pub trait PluginMaterializer: Send + Sync {
    fn materialize(&self, path: &Path) -> Result<Arc<dyn NativePlugin>, PluginError>;
}

/// A parsed `jar` reference: `url` or `url;md5;hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarSpec {
    pub url: String,
    pub hash: Option<String>,
}

impl JarSpec {
    pub fn parse(jar: &str) -> Option<Self> {
        let mut parts = jar.split(";md5;");
        let url = parts.next()?.trim();
        if url.is_empty() {
            return None;
        }
        let hash = parts
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        Some(Self {
            url: url.to_string(),
            hash,
        })
    }

    /// Record key: lowercase hex MD5 of the URL.
    pub fn key(&self) -> String {
        hex::encode(Md5::digest(self.url.as_bytes()))
    }
}

/// Tuning for [`PluginCache`].
#[derive(Debug, Clone)]
pub struct PluginCacheOptions {
    pub dir: PathBuf,
    pub stale_after: Duration,
    pub load_attempts: u32,
    pub retry_delay: Duration,
}

/// A loaded plugin and where it came from.
struct PluginRecord {
    plugin: Arc<dyn NativePlugin>,
    path: PathBuf,
}

/// Shared cache of native plugins.
pub struct PluginCache {
    options: PluginCacheOptions,
    http: reqwest::Client,
    materializer: Arc<dyn PluginMaterializer>,
    records: DashMap<String, PluginRecord>,
}

impl PluginCache {
    pub fn new(options: PluginCacheOptions, http: reqwest::Client, materializer: Arc<dyn PluginMaterializer>) -> Self {
        Self {
            options,
            http,
            materializer,
            records: DashMap::new(),
        }
    }

    /// Resolve a `jar` reference to a loaded plugin. `None` when it cannot
    /// be fetched or loaded; spiders then run without a plugin.
    pub async fn resolve(&self, jar: &str) -> Option<Arc<dyn NativePlugin>> {
        let spec = JarSpec::parse(jar)?;
        let key = spec.key();

        if let Some(record) = self.records.get(&key) {
            tracing::debug!(plugin = %key, path = %record.path.display(), "plugin record reused");
            return Some(record.plugin.clone());
        }

        match self.fetch_and_load(&spec, &key).await {
            Ok(record) => {
                let plugin = record.plugin.clone();
                // A concurrent resolve may have won; keep whichever came first.
                let stored = self.records.entry(key).or_insert(record);
                Some(if Arc::ptr_eq(&stored.plugin, &plugin) {
                    plugin
                } else {
                    stored.plugin.clone()
                })
            }
            Err(e) => {
                tracing::warn!(url = %spec.url, error = %e, "native plugin unavailable");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    /// Path of the cached file for `key`.
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.options
            .dir
            .join("csp")
            .join(format!("{key}.{}", std::env::consts::DLL_EXTENSION))
    }

    async fn fetch_and_load(&self, spec: &JarSpec, key: &str) -> Result<PluginRecord, PluginError> {
        let path = self.file_path(key);

        if self.cached_file_is_current(&path, spec.hash.as_deref()).await {
            match self.materialize_with_retry(&path).await {
                Ok(plugin) => return Ok(PluginRecord { plugin, path }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cached plugin failed to load, refetching"),
            }
        }

        self.download(&spec.url, &path).await?;
        if let Some(expected) = spec.hash.as_deref() {
            let actual = file_md5(&path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                tracing::warn!(url = %spec.url, expected, %actual, "downloaded plugin does not match its pinned hash");
            }
        }
        let plugin = self.materialize_with_retry(&path).await?;
        Ok(PluginRecord { plugin, path })
    }

    async fn cached_file_is_current(&self, path: &Path, hash: Option<&str>) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        match hash {
            Some(expected) => match file_md5(path).await {
                Ok(actual) => actual.eq_ignore_ascii_case(expected),
                Err(_) => false,
            },
            None => {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or(Duration::MAX);
                age < self.options.stale_after
            }
        }
    }

    /// Stream `url` into `path` through a temporary file.
    async fn download(&self, url: &str, path: &Path) -> Result<(), PluginError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::info!(url, path = %path.display(), "downloading native plugin");

        let mut response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PluginError::Status(response.status().as_u16()));
        }

        let partial = path.with_extension("tmp");
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&partial, path).await?;
            Ok::<(), PluginError>(())
        }
        .await;

        if written.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        written
    }

    /// Load the file, polling a few times since a freshly written library
    /// may not be loadable right away.
    async fn materialize_with_retry(&self, path: &Path) -> Result<Arc<dyn NativePlugin>, PluginError> {
        let attempts = self.options.load_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let materializer = self.materializer.clone();
            let file = path.to_path_buf();
            let result = tokio::task::spawn_blocking(move || materializer.materialize(&file))
                .await
                .map_err(|e| PluginError::Load(e.to_string()))
                .and_then(|result| result);

            match result {
                Ok(plugin) => {
                    tracing::info!(plugin = plugin.name(), attempt, "native plugin loaded");
                    return Ok(plugin);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), attempt, error = %e, "plugin load attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| PluginError::Load("no load attempts made".into())))
    }
}

async fn file_md5(path: &Path) -> Result<String, PluginError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Md5::digest(&bytes)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
