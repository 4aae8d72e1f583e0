//! Web server for the extension host.

pub mod router;
pub mod types;

pub use router::create_router;
pub use types::{ServerState, MAX_REQUEST_BODY_SIZE};

use std::future::Future;
use std::net::SocketAddr;

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn run(
    state: ServerState,
    bind: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "Extension host API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
