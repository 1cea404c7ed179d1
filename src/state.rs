//! Shared application state for the HTTP adapter.

use crate::dispatch::Api;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Immutable after startup; every request gets its own session from it.
    pub api: Arc<Api>,
}

impl AppState {
    pub fn new(api: Api) -> Self {
        AppState { api: Arc::new(api) }
    }
}
