//! Server state and types.

use std::sync::Arc;

use neomind_extension_host::ExtensionService;

/// Maximum request body size (10 MB)
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Server state shared across all handlers.
#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<ExtensionService>,
    /// Unix timestamp of server start.
    pub started_at: i64,
}

impl ServerState {
    pub fn new(service: Arc<ExtensionService>) -> Self {
        Self {
            service,
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}
