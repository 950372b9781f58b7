//! Proxy Server
//!
//! The HTTP relay media players fetch proxied URLs from.

mod router;
mod state;

pub use router::*;
pub use state::*;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::registry::SpiderRegistry;

/// Serve the relay on `listener` until `shutdown` resolves, then destroy
/// every spider.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SpiderRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(AppState::new(registry.clone()));
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Proxy relay listening on http://{}", addr);
    }

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    registry.destroy_all().await;
    Ok(())
}
