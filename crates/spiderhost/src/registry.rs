//! Spider Registry
//!
//! Owns every live spider, keyed by site key. Creation resolves the native
//! plugin, spawns and initializes the host; proxy requests are routed by
//! the `siteKey` token carried in proxy URLs, falling back to the most
//! recently activated spider for URLs minted without one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use spiderhost_js_runtime::{
    JsSpider, NetClient, NetError, NullSpider, ProxyResponse, RuntimeServices, SCRIPT_TAG, Spider, SpiderHandle,
    SpiderState, precheck_template,
};

use crate::config::HostConfig;
use crate::plugin::{DylibMaterializer, PluginCache, PluginCacheOptions};

/// Query parameter carrying the spider identity in proxy URLs.
pub const SITE_KEY_PARAM: &str = "siteKey";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Network client: {0}")]
    Net(#[from] NetError),

    #[error("HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

struct LiveSpider {
    spider: SpiderHandle,
    activated: u64,
}

/// Registry of live spiders.
pub struct SpiderRegistry {
    services: RuntimeServices,
    plugins: Arc<PluginCache>,
    spiders: DashMap<String, LiveSpider>,
    recent: RwLock<Option<String>>,
    clock: AtomicU64,
    max_live: usize,
    /// Per-key creation gates, so one key never spawns two hosts while
    /// unrelated keys load in parallel.
    creating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SpiderRegistry {
    pub fn new(services: RuntimeServices, plugins: Arc<PluginCache>, max_live: usize) -> Self {
        Self {
            services,
            plugins,
            spiders: DashMap::new(),
            recent: RwLock::new(None),
            clock: AtomicU64::new(0),
            max_live: max_live.max(1),
            creating: DashMap::new(),
        }
    }

    /// Build the registry and its shared services from configuration.
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &HostConfig) -> Result<Self, RegistryError> {
        let net = Arc::new(NetClient::new(tokio::runtime::Handle::current())?);
        let services = RuntimeServices::new(net)
            .with_proxy_base(config.server.proxy_base())
            .with_timeouts(config.runtime.timeouts())
            .with_limits(config.runtime.limits());

        let plugins = PluginCache::new(
            PluginCacheOptions {
                dir: config.plugins.cache_dir.clone(),
                stale_after: config.plugins.stale_after(),
                load_attempts: config.plugins.load_attempts,
                retry_delay: config.plugins.retry_delay(),
            },
            reqwest::Client::builder().build()?,
            Arc::new(DylibMaterializer),
        );

        Ok(Self::new(services, Arc::new(plugins), config.runtime.max_live_spiders))
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    /// The spider for `key`, creating it from `api` when not live.
    ///
    /// Always returns a spider: a [`NullSpider`] stands in when the template
    /// is rejected or the script fails to load. Only a loaded spider becomes
    /// the recent proxy route.
    pub async fn get_spider(&self, key: &str, api: &str, ext: &str, jar: &str) -> SpiderHandle {
        if let Some(spider) = self.activate(key) {
            tracing::debug!(spider = key, "spider reused");
            return spider;
        }

        let gate = self.creating.entry(key.to_string()).or_default().clone();
        let spider = {
            let _creating = gate.lock().await;
            match self.activate(key) {
                Some(spider) => spider,
                None => self.create(key, api, ext, jar).await,
            }
        };
        drop(gate);
        self.creating.remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        spider
    }

    async fn create(&self, key: &str, api: &str, ext: &str, jar: &str) -> SpiderHandle {
        let plugin = match jar.trim() {
            "" => None,
            jar => self.plugins.resolve(jar).await,
        };

        if !precheck_template(api) {
            tracing::warn!(spider = key, "spider template failed the bracket precheck");
            return Arc::new(NullSpider::new(key));
        }

        let spider = match JsSpider::spawn(key, api, self.services.clone(), plugin) {
            Ok(spider) => spider,
            Err(e) => {
                tracing::error!(spider = key, error = %e, "failed to spawn spider host");
                return Arc::new(NullSpider::new(key));
            }
        };
        spider.init(ext).await;
        if spider.state() != SpiderState::Ready {
            spider.destroy().await;
            return Arc::new(NullSpider::new(key));
        }

        let spider: SpiderHandle = Arc::new(spider);
        let activated = self.tick();
        self.spiders.insert(
            key.to_string(),
            LiveSpider {
                spider: spider.clone(),
                activated,
            },
        );
        *self.recent.write() = Some(key.to_string());
        tracing::info!(spider = key, api, live = self.spiders.len(), "spider registered");

        self.evict_over_limit(key).await;
        spider
    }

    /// A live spider without activating it.
    pub fn get(&self, key: &str) -> Option<SpiderHandle> {
        self.spiders.get(key).map(|live| live.spider.clone())
    }

    pub fn recent_key(&self) -> Option<String> {
        self.recent.read().clone()
    }

    pub fn len(&self) -> usize {
        self.spiders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spiders.is_empty()
    }

    /// Route a proxy request to a spider. `None` when no spider answers.
    pub async fn proxy_invoke(&self, params: &HashMap<String, String>) -> Option<ProxyResponse> {
        let spider = match params.get(SITE_KEY_PARAM).and_then(|key| self.get(key)) {
            Some(spider) => spider,
            None => {
                let recent = self.recent_key()?;
                tracing::debug!(spider = %recent, "proxy request routed to most recent spider");
                self.get(&recent)?
            }
        };
        spider.proxy_local(params).await
    }

    /// Cancel in-flight script network requests.
    pub fn stop_all(&self) {
        self.services.net.cancel_by_tag(SCRIPT_TAG);
    }

    /// Destroy one spider.
    pub async fn remove(&self, key: &str) -> bool {
        let Some((_, live)) = self.spiders.remove(key) else {
            return false;
        };
        live.spider.destroy().await;
        let mut recent = self.recent.write();
        if recent.as_deref() == Some(key) {
            *recent = None;
        }
        true
    }

    /// Cancel requests and destroy every spider.
    pub async fn destroy_all(&self) {
        self.stop_all();
        let keys: Vec<String> = self.spiders.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, live)) = self.spiders.remove(&key) {
                live.spider.destroy().await;
            }
        }
        *self.recent.write() = None;
        self.plugins.clear();
        tracing::info!("all spiders destroyed");
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Mark `key` most recent and return it, if live.
    fn activate(&self, key: &str) -> Option<SpiderHandle> {
        let activated = self.tick();
        let spider = {
            let mut live = self.spiders.get_mut(key)?;
            live.activated = activated;
            live.spider.clone()
        };
        *self.recent.write() = Some(key.to_string());
        Some(spider)
    }

    async fn evict_over_limit(&self, keep: &str) {
        while self.spiders.len() > self.max_live {
            let oldest = self
                .spiders
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.activated)
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else { break };
            tracing::info!(spider = %oldest, max_live = self.max_live, "evicting least recently used spider");
            self.remove(&oldest).await;
        }
    }
}
