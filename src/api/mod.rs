//! API module
//!
//! Request-path middleware: the authorization gate and request logging.

pub mod middleware;

pub use middleware::{enforce, PermissionGate, Requirement};

use axum::Router;

/// Wrap `router` so every route requires what `gate` demands
pub fn gated<S>(router: Router<S>, gate: PermissionGate) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(axum::middleware::from_fn_with_state(gate, enforce))
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
}
