//! The content-provider contract and its implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use spiderhost_plugin_api::NativePlugin;

use crate::error::RuntimeError;
use crate::host::SpiderHost;
use crate::proxy::{ProxyResponse, ProxyVariant, native_arguments};
use crate::services::RuntimeServices;
use crate::state::SpiderState;

/// A loaded content provider.
///
/// Every operation is total: failures are logged by the implementation and
/// reported as `None` or `false`.
#[async_trait]
pub trait Spider: Send + Sync {
    /// Identity the spider was registered under.
    fn key(&self) -> &str;

    async fn init(&self, extend: &str);

    async fn home_content(&self, filter: bool) -> Option<String>;

    async fn home_video_content(&self) -> Option<String>;

    async fn category_content(
        &self,
        tid: &str,
        pg: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> Option<String>;

    /// Only the first id is passed to the script.
    async fn detail_content(&self, ids: &[String]) -> Option<String>;

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> Option<String>;

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> Option<String>;

    async fn manual_video_check(&self) -> bool;

    async fn is_video_format(&self, url: &str) -> bool;

    async fn proxy_local(&self, params: &HashMap<String, String>) -> Option<ProxyResponse>;

    async fn destroy(&self);
}

pub type SpiderHandle = Arc<dyn Spider>;

/// Contract string from a script result.
fn content_of(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn flag_of(value: Option<Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Script-backed spider
// ─────────────────────────────────────────────────────────────────────────────

/// A spider backed by a script engine host.
pub struct JsSpider {
    host: SpiderHost,
}

impl JsSpider {
    /// Spawn the host for `key`. The script is loaded by [`Spider::init`].
    pub fn spawn(
        key: &str,
        api: &str,
        services: RuntimeServices,
        plugin: Option<Arc<dyn NativePlugin>>,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            host: SpiderHost::spawn(key, api, services, plugin)?,
        })
    }

    pub fn state(&self) -> SpiderState {
        self.host.state()
    }

    async fn proxy_native(&self, params: &HashMap<String, String>) -> Option<ProxyResponse> {
        let Some(args) = native_arguments(params) else {
            tracing::debug!(spider = self.key(), "native proxy request without url");
            return None;
        };
        let answer = content_of(self.host.invoke("proxy", args).await)?;
        ProxyResponse::from_native_json(&answer)
    }

    async fn proxy_direct(&self, params: &HashMap<String, String>) -> Option<ProxyResponse> {
        let params: serde_json::Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let answer = self.host.invoke("proxy", vec![Value::Object(params)]).await?;
        let response = ProxyResponse::from_direct(&answer);
        if response.is_none() {
            tracing::warn!(spider = self.key(), "proxy answer is not a response array");
        }
        response
    }
}

#[async_trait]
impl Spider for JsSpider {
    fn key(&self) -> &str {
        self.host.site_key()
    }

    async fn init(&self, extend: &str) {
        // Failures are logged by the host and leave it in `Failed`.
        let _ = self.host.init(extend).await;
    }

    async fn home_content(&self, filter: bool) -> Option<String> {
        content_of(self.host.invoke("home", vec![json!(filter)]).await)
    }

    async fn home_video_content(&self) -> Option<String> {
        content_of(self.host.invoke("homeVod", vec![]).await)
    }

    async fn category_content(
        &self,
        tid: &str,
        pg: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> Option<String> {
        let args = vec![json!(tid), json!(pg), json!(filter), json!(extend)];
        content_of(self.host.invoke("category", args).await)
    }

    async fn detail_content(&self, ids: &[String]) -> Option<String> {
        let id = ids.first()?;
        content_of(self.host.invoke("detail", vec![json!(id)]).await)
    }

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> Option<String> {
        let mut args = vec![json!(key), json!(quick)];
        if let Some(page) = page {
            args.push(json!(page));
        }
        content_of(self.host.invoke("search", args).await)
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> Option<String> {
        let args = vec![json!(flag), json!(id), json!(vip_flags)];
        content_of(self.host.invoke("play", args).await)
    }

    async fn manual_video_check(&self) -> bool {
        flag_of(self.host.invoke("sniffer", vec![]).await)
    }

    async fn is_video_format(&self, url: &str) -> bool {
        flag_of(self.host.invoke("isVideo", vec![json!(url)]).await)
    }

    async fn proxy_local(&self, params: &HashMap<String, String>) -> Option<ProxyResponse> {
        match ProxyVariant::select(params) {
            ProxyVariant::Native => self.proxy_native(params).await,
            ProxyVariant::Direct => self.proxy_direct(params).await,
        }
    }

    async fn destroy(&self) {
        self.host.destroy().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Null spider
// ─────────────────────────────────────────────────────────────────────────────

/// A spider that answers every call with the failure sentinel.
#[derive(Debug, Clone, Default)]
pub struct NullSpider {
    key: String,
}

impl NullSpider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Spider for NullSpider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn init(&self, _extend: &str) {}

    async fn home_content(&self, _filter: bool) -> Option<String> {
        None
    }

    async fn home_video_content(&self) -> Option<String> {
        None
    }

    async fn category_content(
        &self,
        _tid: &str,
        _pg: &str,
        _filter: bool,
        _extend: &HashMap<String, String>,
    ) -> Option<String> {
        None
    }

    async fn detail_content(&self, _ids: &[String]) -> Option<String> {
        None
    }

    async fn search_content(&self, _key: &str, _quick: bool, _page: Option<&str>) -> Option<String> {
        None
    }

    async fn player_content(&self, _flag: &str, _id: &str, _vip_flags: &[String]) -> Option<String> {
        None
    }

    async fn manual_video_check(&self) -> bool {
        false
    }

    async fn is_video_format(&self, _url: &str) -> bool {
        false
    }

    async fn proxy_local(&self, _params: &HashMap<String, String>) -> Option<ProxyResponse> {
        None
    }

    async fn destroy(&self) {}
}
