//! HTTP Router
//!
//! `/proxy` relays a spider's proxy answer as the response body.

use std::collections::HashMap;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use spiderhost_js_runtime::ProxyResponse;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/proxy", get(proxy))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn proxy(State(state): State<AppState>, Query(params): Query<HashMap<String, String>>) -> Response {
    match state.registry().proxy_invoke(&params).await {
        Some(answer) => relay(answer),
        None => (StatusCode::NOT_FOUND, "no spider answered").into_response(),
    }
}

/// Convert a proxy answer into an HTTP response.
fn relay(answer: ProxyResponse) -> Response {
    let status = answer
        .status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = Response::new(Body::from(answer.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in answer.headers.into_iter().flatten() {
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(&value)) else {
            tracing::debug!(header = %name, "dropping invalid proxy header");
            continue;
        };
        // Framing is the server's job.
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        headers.insert(name, value);
    }
    if let Some(content_type) = answer
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    response
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    spiders: usize,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        spiders: state.registry().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use spiderhost_js_runtime::{MemoryModuleSource, NetClient, RuntimeServices};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::plugin::{DylibMaterializer, PluginCache, PluginCacheOptions};
    use crate::registry::SpiderRegistry;

    const SEGMENT_SPIDER: &str = r#"
        export default {
            init() {},
            proxy(p) {
                if (p.id === 'partial') {
                    return [206, 'video/mp2t', [1, 2, 3], { 'X-Segment': 'one', 'Content-Length': '99' }];
                }
                if (p.id === 'none') return null;
                return [200, 'text/plain', 'seg:' + p.id];
            },
        };
    "#;

    fn registry() -> Arc<SpiderRegistry> {
        let source = MemoryModuleSource::new().with("segments.js", SEGMENT_SPIDER);
        let net = Arc::new(NetClient::new(tokio::runtime::Handle::current()).unwrap());
        let services = RuntimeServices::new(net).with_modules(Arc::new(source));
        let plugins = PluginCache::new(
            PluginCacheOptions {
                dir: std::env::temp_dir().join("spiderhost-router-tests"),
                stale_after: Duration::from_secs(60),
                load_attempts: 1,
                retry_delay: Duration::from_millis(1),
            },
            reqwest::Client::new(),
            Arc::new(DylibMaterializer),
        );
        Arc::new(SpiderRegistry::new(services, Arc::new(plugins), 4))
    }

    async fn start(registry: Arc<SpiderRegistry>) -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(crate::server::serve(listener, registry, async move {
            let _ = stop_rx.await;
        }));
        (base, stop_tx)
    }

    #[test]
    fn test_relay_defaults_and_header_filtering() {
        let mut headers = HashMap::new();
        headers.insert("X-Segment".to_string(), "one".to_string());
        headers.insert("Content-Length".to_string(), "99".to_string());
        headers.insert("Bad Header".to_string(), "x".to_string());

        let response = relay(ProxyResponse {
            status: None,
            content_type: Some("video/mp2t".to_string()),
            body: bytes::Bytes::from_static(b"abc"),
            headers: Some(headers),
        });

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(response.headers()["x-segment"], "one");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_proxy_endpoint_relays_spider_answer() {
        let registry = registry();
        registry.get_spider("seg", "segments.js", "", "").await;
        let (base, stop) = start(registry.clone()).await;
        let client = reqwest::Client::new();

        let plain = client
            .get(format!("{base}/proxy?do=js&siteKey=seg&id=7"))
            .send()
            .await
            .unwrap();
        assert_eq!(plain.status(), 200);
        assert_eq!(plain.headers()["content-type"], "text/plain");
        assert_eq!(plain.text().await.unwrap(), "seg:7");

        let partial = client
            .get(format!("{base}/proxy?do=js&siteKey=seg&id=partial"))
            .send()
            .await
            .unwrap();
        assert_eq!(partial.status(), 206);
        assert_eq!(partial.headers()["x-segment"], "one");
        assert_eq!(&partial.bytes().await.unwrap()[..], &[1, 2, 3]);

        let missing = client
            .get(format!("{base}/proxy?do=js&siteKey=seg&id=none"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["spiders"], 1);

        stop.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_destroys_spiders() {
        let registry = registry();
        registry.get_spider("seg", "segments.js", "", "").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        crate::server::serve(listener, registry.clone(), async {}).await.unwrap();
        assert!(registry.is_empty());
    }
}
