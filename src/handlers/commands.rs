//! Command definitions
//!
//! Commands represent intentions to change RBAC or directory state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Permission, Role};

// =========================================================================
// Role provisioning
// =========================================================================

/// Command to create a tenant role from grant patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRoleCommand {
    pub tenant_id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    /// Concrete codes or `prefix.*` wildcards
    pub grants: Vec<String>,
}

impl ProvisionRoleCommand {
    pub fn new(tenant_id: Uuid, code: &str, name: &str) -> Self {
        Self {
            tenant_id,
            code: code.to_string(),
            name: name.to_string(),
            description: None,
            is_system: false,
            grants: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_grants<I, S>(mut self, grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants.extend(grants.into_iter().map(Into::into));
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

/// Result of a successful provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRoleResult {
    pub role: Role,
    /// Concrete codes materialized for the role, sorted
    pub permissions: Vec<Permission>,
}

impl ProvisionRoleResult {
    pub fn permission_codes(&self) -> Vec<String> {
        self.permissions.iter().map(|p| p.code.clone()).collect()
    }
}

// =========================================================================
// Assignments
// =========================================================================

/// Command to grant a role to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRoleCommand {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AssignRoleCommand {
    pub fn new(tenant_id: Uuid, user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            role_id,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Command to take a role away from a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeRoleCommand {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
}

impl RevokeRoleCommand {
    pub fn new(tenant_id: Uuid, user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            role_id,
        }
    }
}

// =========================================================================
// Directory
// =========================================================================

/// Command to mirror an identity from the authentication service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncUserCommand {
    pub tenant_id: Uuid,
    pub external_id: Uuid,
    pub email: String,
    /// When the authority observed this state; defaults to now
    pub observed_at: Option<DateTime<Utc>>,
}

impl SyncUserCommand {
    pub fn new(tenant_id: Uuid, external_id: Uuid, email: &str) -> Self {
        Self {
            tenant_id,
            external_id,
            email: email.to_string(),
            observed_at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_role_command_builder() {
        let tenant = Uuid::new_v4();
        let cmd = ProvisionRoleCommand::new(tenant, "finance_admin", "Finance Administrator")
            .with_description("Full access")
            .with_grants(["treasury.payments.*", "treasury.users.manage"])
            .system();

        assert_eq!(cmd.tenant_id, tenant);
        assert_eq!(cmd.grants.len(), 2);
        assert!(cmd.is_system);
        assert_eq!(cmd.description.as_deref(), Some("Full access"));
    }

    #[test]
    fn test_assign_role_command_expiry() {
        let at = Utc::now();
        let cmd = AssignRoleCommand::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()).expiring_at(at);
        assert_eq!(cmd.expires_at, Some(at));
    }
}
