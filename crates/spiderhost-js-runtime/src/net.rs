//! Network object backing the script `http` global.
//!
//! Engine threads are plain OS threads without a tokio runtime of their own,
//! so script requests are driven to completion on the host runtime through
//! [`NetClient::fetch_blocking`]. Every request carries a tag; cancelling a
//! tag aborts everything in flight under it.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Url};
use serde_json::{Map, Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;

/// Tag shared by all script-originated requests.
pub const SCRIPT_TAG: &str = "spider-script";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("spiderhost/", env!("CARGO_PKG_VERSION"));

/// How a response body is handed back to the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// Decoded text, or `""` for binary bodies.
    #[default]
    Text,
    /// Array of byte values.
    Bytes,
    /// Base64 string.
    Base64,
}

impl BufferMode {
    fn from_flag(flag: u64) -> Self {
        match flag {
            1 => BufferMode::Bytes,
            2 => BufferMode::Base64,
            _ => BufferMode::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
    Raw { content_type: String, body: String },
}

/// A request as described by a script options object.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
    pub timeout: Duration,
    pub redirect: bool,
    pub buffer: BufferMode,
}

impl Default for ScriptRequest {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
            timeout: DEFAULT_TIMEOUT,
            redirect: true,
            buffer: BufferMode::Text,
        }
    }
}

impl ScriptRequest {
    /// Build a request from the options object a script passed to `http()`.
    ///
    /// Unknown or mistyped options fall back to defaults rather than failing.
    pub fn from_options(options: &Value) -> Self {
        let mut request = ScriptRequest::default();
        let Some(options) = options.as_object() else {
            return request;
        };

        if let Some(method) = options.get("method").and_then(Value::as_str) {
            request.method = match method.to_ascii_lowercase().as_str() {
                "get" | "" => Method::GET,
                "post" => Method::POST,
                "header" | "head" => Method::HEAD,
                other => Method::from_bytes(other.to_ascii_uppercase().as_bytes()).unwrap_or(Method::GET),
            };
        }

        if let Some(headers) = options.get("headers").and_then(Value::as_object) {
            request.headers = headers
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect();
        }

        if let Some(ms) = options.get("timeout").and_then(Value::as_u64) {
            request.timeout = Duration::from_millis(ms);
        }

        match options.get("redirect") {
            Some(Value::Bool(follow)) => request.redirect = *follow,
            Some(Value::Number(n)) => request.redirect = n.as_i64() != Some(0),
            _ => {}
        }

        request.buffer = BufferMode::from_flag(options.get("buffer").and_then(Value::as_u64).unwrap_or(0));

        if request.method == Method::POST {
            let post_type = options.get("postType").and_then(Value::as_str).unwrap_or("json");
            request.body = match (options.get("data").filter(|d| !d.is_null()), options.get("body")) {
                (Some(data), _) => match post_type {
                    "form" => RequestBody::Form(flatten_fields(data)),
                    "form-data" => RequestBody::Multipart(flatten_fields(data)),
                    _ => RequestBody::Json(data.clone()),
                },
                (None, Some(Value::String(body))) => RequestBody::Raw {
                    content_type: request
                        .header("content-type")
                        .unwrap_or("text/plain")
                        .to_string(),
                    body: body.clone(),
                },
                _ => RequestBody::Empty,
            };
        }

        request
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_fields(data: &Value) -> Vec<(String, String)> {
    data.as_object()
        .map(|fields| {
            fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()
        })
        .unwrap_or_default()
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct ScriptResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ScriptResponse {
    /// Marshal into the `{ code, headers, content }` object scripts expect.
    pub fn to_script_value(&self, buffer: BufferMode) -> Value {
        let content = match buffer {
            BufferMode::Text if self.is_binary() => Value::String(String::new()),
            BufferMode::Text => Value::String(String::from_utf8_lossy(&self.body).into_owned()),
            BufferMode::Bytes => Value::Array(self.body.iter().map(|b| json!(b)).collect()),
            BufferMode::Base64 => Value::String(STANDARD.encode(&self.body)),
        };
        json!({
            "code": self.status,
            "headers": headers_to_value(&self.headers),
            "content": content,
        })
    }

    /// Binary by content type, or more than 10% control bytes.
    pub fn is_binary(&self) -> bool {
        let content_type = self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if ["image/", "audio/", "video/", "application/octet-stream"]
            .iter()
            .any(|kind| content_type.contains(kind))
        {
            return true;
        }
        let control = self
            .body
            .iter()
            .filter(|&&b| b < 32 && b != b'\t' && b != b'\n' && b != b'\r')
            .count();
        control as f64 > self.body.len() as f64 * 0.1
    }
}

/// Single-valued headers become strings, repeated ones arrays.
fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let value = match values.len() {
            1 => values.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(values),
        };
        out.insert(name.as_str().to_string(), value);
    }
    Value::Object(out)
}

/// The `{ code: 0, headers: {}, content: "" }` object scripts see on failure.
pub fn failed_response() -> Value {
    json!({ "code": 0, "headers": {}, "content": "" })
}

/// HTTP client shared by all engine hosts of one registry.
pub struct NetClient {
    follow: Client,
    manual: Client,
    tags: DashMap<String, CancellationToken>,
    handle: Handle,
}

impl NetClient {
    /// Create a client whose blocking calls run on `handle`.
    pub fn new(handle: Handle) -> Result<Self, NetError> {
        let follow = Client::builder().user_agent(USER_AGENT).build()?;
        let manual = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            follow,
            manual,
            tags: DashMap::new(),
            handle,
        })
    }

    fn token(&self, tag: &str) -> CancellationToken {
        self.tags.entry(tag.to_string()).or_default().clone()
    }

    /// Cancel every in-flight request carrying `tag`.
    ///
    /// Requests started afterwards get a fresh token and are unaffected.
    pub fn cancel_by_tag(&self, tag: &str) {
        if let Some((_, token)) = self.tags.remove(tag) {
            tracing::debug!(tag, "cancelling tagged requests");
            token.cancel();
        }
    }

    pub async fn fetch(
        &self,
        url: &str,
        request: &ScriptRequest,
        tag: &str,
    ) -> Result<ScriptResponse, NetError> {
        let parsed = Url::parse(url).map_err(|e| NetError::InvalidUrl(url.to_string(), e.to_string()))?;
        let client = if request.redirect { &self.follow } else { &self.manual };

        let mut builder = client.request(request.method.clone(), parsed).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(data) => builder.json(data),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Multipart(fields) => {
                let form = fields
                    .iter()
                    .fold(reqwest::multipart::Form::new(), |form, (k, v)| form.text(k.clone(), v.clone()));
                builder.multipart(form)
            }
            RequestBody::Raw { content_type, body } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(body.clone()),
        };

        let token = self.token(tag);
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(ScriptResponse { status, headers, body })
        };

        tokio::select! {
            _ = token.cancelled() => Err(NetError::Cancelled),
            result = exchange => Ok(result?),
        }
    }

    /// Run [`fetch`](Self::fetch) from a thread outside the tokio runtime.
    pub fn fetch_blocking(
        &self,
        url: &str,
        request: &ScriptRequest,
        tag: &str,
    ) -> Result<ScriptResponse, NetError> {
        self.handle.block_on(self.fetch(url, request, tag))
    }

    /// GET a text resource, `None` on any failure or non-success status.
    pub fn fetch_text_blocking(&self, url: &str) -> Option<String> {
        match self.fetch_blocking(url, &ScriptRequest::default(), SCRIPT_TAG) {
            Ok(response) if (200..300).contains(&response.status) => {
                Some(String::from_utf8_lossy(&response.body).into_owned())
            }
            Ok(response) => {
                tracing::warn!(url, status = response.status, "module fetch returned non-success status");
                None
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "module fetch failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for NetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetClient")
            .field("tags", &self.tags.len())
            .finish_non_exhaustive()
    }
}
