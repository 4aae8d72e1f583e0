//! HTTP API for the NeoMind extension host.
//!
//! Thin axum layer over [`neomind_extension_host::ExtensionService`]; every
//! route maps onto one dispatch operation.

pub mod handlers;
pub mod models;
pub mod server;

pub use models::{ApiError, ApiResponse, ErrorResponse};
pub use server::{create_router, run, ServerState, MAX_REQUEST_BODY_SIZE};
