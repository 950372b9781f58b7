//! Where module text comes from, and how module names resolve.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Url;

use crate::net::NetClient;

/// Support module evaluated in every engine host.
pub const NET_SUPPORT_MODULE: &str = "net.js";

const NET_JS: &str = include_str!("assets/net.js");

const BUILTIN_MODULES: &[(&str, &str)] = &[(NET_SUPPORT_MODULE, NET_JS)];

/// Accessor for module and spider text.
pub trait ModuleSource: Send + Sync {
    /// Raw text for `name`, or `None` when it cannot be fetched.
    fn load(&self, name: &str) -> Option<String>;
}

fn builtin(name: &str) -> Option<&'static str> {
    let local = name.strip_prefix("assets://").unwrap_or(name);
    if local.contains("://") {
        return None;
    }
    let file = local.rsplit('/').next().unwrap_or(local);
    BUILTIN_MODULES
        .iter()
        .find(|(builtin, _)| *builtin == file)
        .map(|(_, text)| *text)
}

/// Built-in assets, then http(s), then the local filesystem.
pub struct RemoteModuleSource {
    net: Arc<NetClient>,
}

impl RemoteModuleSource {
    pub fn new(net: Arc<NetClient>) -> Self {
        Self { net }
    }
}

impl ModuleSource for RemoteModuleSource {
    fn load(&self, name: &str) -> Option<String> {
        if let Some(text) = builtin(name) {
            return Some(text.to_string());
        }
        if name.starts_with("http://") || name.starts_with("https://") {
            return self.net.fetch_text_blocking(name);
        }

        let path = name.strip_prefix("file://").unwrap_or(name);
        match std::fs::read_to_string(Path::new(path)) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(module = name, error = %e, "module not readable");
                None
            }
        }
    }
}

/// Fixed in-memory modules, with built-in assets as fallback.
#[derive(Debug, Default)]
pub struct MemoryModuleSource {
    modules: HashMap<String, String>,
    fetches: DashMap<String, usize>,
}

impl MemoryModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.modules.insert(name.into(), text.into());
        self
    }

    /// How many times `name` has been served.
    pub fn fetch_count(&self, name: &str) -> usize {
        self.fetches.get(name).map(|n| *n).unwrap_or(0)
    }
}

impl ModuleSource for MemoryModuleSource {
    fn load(&self, name: &str) -> Option<String> {
        let text = self
            .modules
            .get(name)
            .cloned()
            .or_else(|| builtin(name).map(str::to_string))?;
        *self.fetches.entry(name.to_string()).or_default() += 1;
        Some(text)
    }
}

/// Resolve `name` as imported from module `base`.
///
/// Names with a scheme are already absolute. Otherwise the name is joined to
/// the importing module: URL semantics when the base is a URL, path
/// semantics (with `.` and `..` folded) when it is not.
pub fn resolve_module_name(base: &str, name: &str) -> String {
    if Url::parse(name).is_ok() {
        return name.to_string();
    }
    if let Ok(base_url) = Url::parse(base) {
        if let Ok(joined) = base_url.join(name) {
            return joined.to_string();
        }
    }
    if name.starts_with('/') {
        return normalize_path(name);
    }
    let dir = base.rfind('/').map(|i| &base[..=i]).unwrap_or("");
    normalize_path(&format!("{dir}{name}"))
}

fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_urls() {
        assert_eq!(
            resolve_module_name("https://cdn.example/js/drpy2.js", "./lib/cheerio.min.js"),
            "https://cdn.example/js/lib/cheerio.min.js"
        );
        assert_eq!(
            resolve_module_name("https://cdn.example/js/drpy2.js", "../crypto-js.js"),
            "https://cdn.example/crypto-js.js"
        );
        assert_eq!(
            resolve_module_name("spider_root.js", "https://cdn.example/a.js"),
            "https://cdn.example/a.js"
        );
    }

    #[test]
    fn test_resolve_paths() {
        assert_eq!(resolve_module_name("/srv/spiders/a.js", "./util.js"), "/srv/spiders/util.js");
        assert_eq!(resolve_module_name("/srv/spiders/a.js", "../lib/x.js"), "/srv/lib/x.js");
        assert_eq!(resolve_module_name("spider_root.js", "spider.js"), "spider.js");
        assert_eq!(resolve_module_name("lib/a.js", "../../b.js"), "../b.js");
        assert_eq!(resolve_module_name("x.js", "/abs/./y.js"), "/abs/y.js");
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("net.js").is_some());
        assert!(builtin("assets://js/lib/net.js").is_some());
        assert!(builtin("https://evil.example/net.js").is_none());
        assert!(builtin("other.js").is_none());
    }

    #[test]
    fn test_memory_source_counts_fetches() {
        let source = MemoryModuleSource::new().with("a.js", "export default 1");
        assert_eq!(source.load("a.js").as_deref(), Some("export default 1"));
        assert!(source.load("missing.js").is_none());
        assert!(source.load("net.js").is_some());
        assert_eq!(source.fetch_count("a.js"), 1);
        assert_eq!(source.fetch_count("missing.js"), 0);
    }
}
