//! Command Handlers module
//!
//! Handlers that orchestrate RBAC and directory operations.
//! Each mutating handler writes its state change and the matching outbox
//! record atomically, then wakes the relay.

mod assignment_handler;
mod commands;
mod directory_sync;
mod permission_handler;
mod role_handler;
pub mod seed;


pub use assignment_handler::AssignmentHandler;
pub use commands::*;
pub use directory_sync::DirectorySyncService;
pub use permission_handler::PermissionHandler;
pub use role_handler::{expand_grants, RoleHandler};

use uuid::Uuid;

use crate::authz::AuthorizationEngine;
use crate::domain::AuthContext;
use crate::error::AppError;

/// Grant required to change roles and assignments
pub const MANAGE_ACCESS_PERMISSION: &str = "treasury.users.manage";

/// Reject operations on a tenant other than the caller's own
fn ensure_tenant(context: &AuthContext, tenant_id: Uuid) -> Result<(), AppError> {
    if context.tenant_id == tenant_id || context.is_superuser() {
        return Ok(());
    }

    tracing::warn!(
        caller_tenant = %context.tenant_id,
        target_tenant = %tenant_id,
        user_id = %context.user_id,
        "Cross-tenant operation rejected"
    );
    Err(AppError::Forbidden("operation targets another tenant".to_string()))
}

/// Gate for role and assignment mutations: same tenant, and the caller holds
/// [`MANAGE_ACCESS_PERMISSION`]. Superusers pass both checks.
pub(crate) async fn authorize_mutation(
    engine: &AuthorizationEngine,
    context: &AuthContext,
    tenant_id: Uuid,
) -> Result<(), AppError> {
    ensure_tenant(context, tenant_id)?;
    engine
        .require_permission(context, MANAGE_ACCESS_PERMISSION)
        .await
}
