//! API Middleware
//!
//! Request-path authorization gate and request logging.
//!
//! The upstream authentication layer attaches an [`AuthContext`] to the
//! request extensions; the gate only consults it.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::authz::AuthorizationEngine;
use crate::domain::AuthContext;
use crate::error::AppError;

/// What a gated route requires of the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Permission(String),
    Role(String),
}

/// State for [`enforce`]
#[derive(Clone)]
pub struct PermissionGate {
    engine: AuthorizationEngine,
    requirement: Requirement,
}

impl PermissionGate {
    /// Require a permission code, e.g. `treasury.payments.approve`
    pub fn permission(engine: AuthorizationEngine, code: &str) -> Self {
        Self {
            engine,
            requirement: Requirement::Permission(code.to_string()),
        }
    }

    /// Require a role code, e.g. `finance_admin`
    pub fn role(engine: AuthorizationEngine, role_code: &str) -> Self {
        Self {
            engine,
            requirement: Requirement::Role(role_code.to_string()),
        }
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }
}

// =========================================================================
// Authorization gate
// =========================================================================

/// Reject the request unless the attached identity meets the gate's requirement.
///
/// No identity yields 401; a denial or an undeterminable check yields 403.
pub async fn enforce(
    State(gate): State<PermissionGate>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let identity = request
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or(AppError::Unauthenticated)?;

    match &gate.requirement {
        Requirement::Permission(code) => gate.engine.require_permission(&identity, code).await?,
        Requirement::Role(role_code) => gate.engine.require_role(&identity, role_code).await?,
    }

    Ok(next.run(request).await)
}

// =========================================================================
// Request logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

/// Request logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = mask_headers_for_logging(request.headers());

    let (tenant_id, correlation_id) = request
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| (Some(ctx.tenant_id), ctx.correlation_id))
        .unwrap_or((None, None));

    let start = std::time::Instant::now();
    tracing::info!(
        method = %method,
        uri = %uri,
        tenant_id = ?tenant_id,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        duration_ms = %start.elapsed().as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}
