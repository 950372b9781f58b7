//! Server Application State

use std::sync::Arc;

use crate::registry::SpiderRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    registry: Arc<SpiderRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SpiderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SpiderRegistry {
        &self.registry
    }
}
