//! RBAC model
//!
//! Permission catalog, tenant roles, and user→role assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DomainError;

/// Global permission catalog entry, keyed by its unique dotted code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for adding a permission to the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPermission {
    pub code: String,
    pub name: String,
    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: Option<String>,
}

impl NewPermission {
    pub fn new(code: &str, name: &str, module: &str, action: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            module: module.to_string(),
            action: action.to_string(),
            resource: None,
            description: None,
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Validate and materialize into a catalog entry
    pub fn into_permission(self) -> Result<Permission, DomainError> {
        validate_permission_code(&self.code)?;
        if self.module.trim().is_empty() || self.action.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "permission '{}' requires module and action",
                self.code
            )));
        }

        Ok(Permission {
            id: Uuid::new_v4(),
            code: self.code,
            name: self.name,
            module: self.module,
            action: self.action,
            resource: self.resource,
            description: self.description,
            created_at: Utc::now(),
        })
    }
}

/// A permission code is at least two non-empty dot-separated segments.
pub fn validate_permission_code(code: &str) -> Result<(), DomainError> {
    let segments: Vec<&str> = code.split('.').collect();
    let well_formed = segments.len() >= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if well_formed {
        Ok(())
    } else {
        Err(DomainError::InvalidPermissionCode(code.to_string()))
    }
}

/// Tenant-scoped role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(tenant_id: Uuid, code: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            code: code.to_string(),
            name: name.to_string(),
            description: None,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Role ↔ permission join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
}

/// User → role link within a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_by: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Assignment {
    /// Active iff it has no expiry or the expiry is strictly in the future of `at`.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > at)
    }
}

/// A provisioning-time grant: a concrete code or a `prefix.*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantPattern {
    Exact(String),
    /// Stored without the trailing `.*`
    Wildcard(String),
}

impl GrantPattern {
    pub fn parse(pattern: &str) -> Result<Self, DomainError> {
        match pattern.strip_suffix(".*") {
            Some(prefix) => {
                if prefix.is_empty()
                    || prefix.split('.').any(|segment| segment.is_empty() || segment.contains('*'))
                {
                    return Err(DomainError::InvalidGrantPattern(pattern.to_string()));
                }
                Ok(GrantPattern::Wildcard(prefix.to_string()))
            }
            None if pattern.contains('*') => {
                Err(DomainError::InvalidGrantPattern(pattern.to_string()))
            }
            None => {
                validate_permission_code(pattern)?;
                Ok(GrantPattern::Exact(pattern.to_string()))
            }
        }
    }

    /// Whether a catalog code falls under this pattern
    pub fn matches(&self, code: &str) -> bool {
        match self {
            GrantPattern::Exact(exact) => exact == code,
            // `treasury.payments.*` must not match `treasury.paymentsx.view`
            GrantPattern::Wildcard(prefix) => code
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        }
    }
}

impl std::fmt::Display for GrantPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantPattern::Exact(code) => write!(f, "{}", code),
            GrantPattern::Wildcard(prefix) => write!(f, "{}.*", prefix),
        }
    }
}
