//! Shared application state injected into the upgrade handler.

use std::sync::Arc;

use crate::config::RelayConfig;

/// Read-only state available to handlers via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Configuration resolved at startup.
    pub config: Arc<RelayConfig>,
}
