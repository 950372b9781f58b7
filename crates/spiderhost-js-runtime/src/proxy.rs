//! Proxy relay: turns a spider's proxy answer into a byte response.
//!
//! Two shapes exist. Direct spiders return an array
//! `[status, contentType, body, headers?, bufferMode?]`. Spiders driven
//! through a native plugin (`from=catvod`) receive the split URL and the
//! parsed header, and return one JSON string describing the response.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// Content type used when a native-plugin answer names none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Base64 buffer flag of a direct answer's fifth element.
const DIRECT_BASE64: i64 = 1;

/// Base64 buffer flag of a native-plugin answer.
const NATIVE_BASE64: i64 = 2;

/// A relayed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    /// Status reported by the script; `None` when it gave none
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub headers: Option<HashMap<String, String>>,
}

/// Which proxy shape a request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVariant {
    Direct,
    Native,
}

impl ProxyVariant {
    pub fn select(params: &HashMap<String, String>) -> Self {
        match params.get("from").map(String::as_str) {
            Some("catvod") => ProxyVariant::Native,
            _ => ProxyVariant::Direct,
        }
    }
}

/// Arguments for the native variant's `proxy(segments, header)` call.
/// `None` when the request has no `url`.
pub fn native_arguments(params: &HashMap<String, String>) -> Option<Vec<Value>> {
    let url = params.get("url").filter(|url| !url.is_empty())?;
    let segments: Vec<Value> = url.split('/').map(|s| Value::String(s.to_string())).collect();
    let header = params
        .get("header")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .unwrap_or(Value::Null);
    Some(vec![Value::Array(segments), header])
}

impl ProxyResponse {
    /// Read a direct answer. Missing or malformed parts degrade to
    /// `None`/empty; fewer than three elements is no answer at all.
    pub fn from_direct(value: &Value) -> Option<Self> {
        let items = value.as_array().filter(|items| items.len() >= 3)?;

        let status = items[0].as_u64().and_then(|s| u16::try_from(s).ok());
        let content_type = items[1].as_str().map(str::to_string);
        let headers = items.get(3).filter(|h| !h.is_null()).map(headers_from);

        let base64 = items.get(4).and_then(Value::as_i64) == Some(DIRECT_BASE64);
        let body = if base64 {
            let text = value_text(&items[2]);
            let encoded = match text.find("base64,") {
                Some(at) => &text[at + "base64,".len()..],
                None => text.as_str(),
            };
            match decode_base64(encoded) {
                Some(bytes) => Bytes::from(bytes),
                None => body_from(&items[2]),
            }
        } else {
            body_from(&items[2])
        };

        Some(Self {
            status,
            content_type,
            body,
            headers,
        })
    }

    /// Read a native-plugin answer: a JSON string with `content`,
    /// `contentType` and `buffer`.
    pub fn from_native_json(json: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct NativeAnswer {
            #[serde(default)]
            content: String,
            #[serde(default, rename = "contentType", alias = "content-type")]
            content_type: Option<String>,
            #[serde(default)]
            buffer: i64,
        }

        if json.trim().is_empty() {
            return None;
        }
        let answer: NativeAnswer = match serde_json::from_str(json) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "native proxy answer is not a response object");
                return None;
            }
        };

        let content_type = answer
            .content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let body = if answer.buffer == NATIVE_BASE64 {
            decode_base64(&answer.content).map(Bytes::from).unwrap_or_default()
        } else {
            Bytes::from(answer.content)
        };

        Some(Self {
            status: Some(200),
            content_type: Some(content_type),
            body,
            headers: None,
        })
    }
}

fn decode_base64(text: &str) -> Option<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match STANDARD.decode(compact) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "proxy body is not valid base64");
            None
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Arrays of integers in `0..=255` are byte sequences, anything else is text.
fn body_from(value: &Value) -> Bytes {
    if let Value::Array(items) = value {
        match byte_array(items) {
            Some(bytes) => return Bytes::from(bytes),
            None => tracing::debug!(len = items.len(), "proxy body array is not a byte sequence, relaying as text"),
        }
    }
    Bytes::from(value_text(value))
}

fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|n| n.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

fn headers_from(value: &Value) -> HashMap<String, String> {
    let parsed;
    let object = match value {
        Value::Object(map) => Some(map),
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).ok();
            parsed.as_ref().and_then(Value::as_object)
        }
        _ => None,
    };
    object
        .map(|map| map.iter().map(|(k, v)| (k.clone(), value_text(v))).collect())
        .unwrap_or_default()
}
