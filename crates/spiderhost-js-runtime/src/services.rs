//! Services shared by engine hosts.
//!
//! Every host gets its own engine and thread, but networking, module
//! sources, the compiled-module cache and the local store are shared.

use std::sync::Arc;
use std::time::Duration;

use crate::bytecode::BytecodeCache;
use crate::local::LocalStore;
use crate::net::NetClient;
use crate::source::{ModuleSource, RemoteModuleSource};

/// Bounds applied to script calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// How long the engine thread drives a call's pending jobs.
    pub call: Duration,
    /// How long a caller waits for the engine thread to answer.
    pub dispatch: Duration,
    /// How long a caller waits for load + `init`.
    pub init: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            dispatch: Duration::from_secs(35),
            init: Duration::from_secs(60),
        }
    }
}

/// Engine resource limits. Zero means unlimited / engine default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineLimits {
    pub memory_bytes: usize,
    pub stack_bytes: usize,
}

/// Services handed to every spawned engine host.
#[derive(Clone)]
pub struct RuntimeServices {
    /// Network object backing `http`
    pub net: Arc<NetClient>,
    /// Module and spider text accessor
    pub modules: Arc<dyn ModuleSource>,
    /// Compiled shared libraries
    pub bytecode: Arc<BytecodeCache>,
    /// Store behind `local`
    pub local: Arc<LocalStore>,
    /// Base address of the proxy relay, e.g. `http://127.0.0.1:9978`
    pub proxy_base: String,
    pub timeouts: CallTimeouts,
    pub limits: EngineLimits,
}

impl RuntimeServices {
    /// Services fetching modules over the network and from disk.
    pub fn new(net: Arc<NetClient>) -> Self {
        Self {
            modules: Arc::new(RemoteModuleSource::new(net.clone())),
            net,
            bytecode: BytecodeCache::shared(),
            local: Arc::new(LocalStore::new()),
            proxy_base: "http://127.0.0.1:9978".to_string(),
            timeouts: CallTimeouts::default(),
            limits: EngineLimits::default(),
        }
    }

    pub fn with_modules(mut self, modules: Arc<dyn ModuleSource>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_bytecode(mut self, bytecode: Arc<BytecodeCache>) -> Self {
        self.bytecode = bytecode;
        self
    }

    pub fn with_local(mut self, local: Arc<LocalStore>) -> Self {
        self.local = local;
        self
    }

    pub fn with_proxy_base(mut self, proxy_base: impl Into<String>) -> Self {
        self.proxy_base = proxy_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Relay address a spider embeds in the URLs it hands to players.
    ///
    /// Carries the spider's key as `siteKey` so the relay can route the
    /// request back without relying on which spider was used last.
    pub fn proxy_url(&self, site_key: &str) -> String {
        let base = format!("{}/proxy", self.proxy_base);
        match reqwest::Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("do", "js")
                    .append_pair("siteKey", site_key);
                url.to_string()
            }
            Err(_) => format!("{base}?do=js"),
        }
    }
}
