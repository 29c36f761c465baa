//! Authentication Context
//!
//! The authenticated-identity assertion attached to each request by the
//! upstream authentication layer. Its integrity is trusted as given.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Scope granting unconditional access
pub const SUPERUSER_SCOPE: &str = "superuser";

/// Identity of the caller for the current operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Tenant the caller acts within
    pub tenant_id: Uuid,

    /// User id issued by the authentication service
    pub user_id: Uuid,

    /// Scopes carried by the caller's token
    #[serde(default)]
    pub scopes: BTreeSet<String>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl AuthContext {
    /// Create a new context without scopes
    pub fn new(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            scopes: BTreeSet::new(),
            correlation_id: None,
        }
    }

    /// Add a scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.insert(scope.into());
        self
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Superusers bypass permission and role resolution entirely
    pub fn is_superuser(&self) -> bool {
        self.has_scope(SUPERUSER_SCOPE)
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }
}
