//! Domain Events
//!
//! Outbound RBAC events written to the outbox, and inbound identity
//! lifecycle events published by the authentication service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::Payload;
use super::rbac::{Assignment, Role};

/// RBAC state changes propagated through the outbox
#[derive(Debug, Clone, PartialEq)]
pub enum RbacEvent {
    RoleProvisioned {
        role: Role,
        permission_codes: Vec<String>,
        provisioned_by: Uuid,
    },
    RoleDeleted {
        role: Role,
        deleted_by: Uuid,
    },
    RoleAssigned {
        assignment: Assignment,
        role_code: String,
    },
    RoleRevoked {
        assignment: Assignment,
        role_code: String,
        revoked_by: Uuid,
    },
}

impl RbacEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            RbacEvent::RoleProvisioned { .. } => "role.provisioned",
            RbacEvent::RoleDeleted { .. } => "role.deleted",
            RbacEvent::RoleAssigned { .. } => "role.assigned",
            RbacEvent::RoleRevoked { .. } => "role.revoked",
        }
    }

    pub fn aggregate_type(&self) -> &'static str {
        match self {
            RbacEvent::RoleProvisioned { .. } | RbacEvent::RoleDeleted { .. } => "role",
            RbacEvent::RoleAssigned { .. } | RbacEvent::RoleRevoked { .. } => "role_assignment",
        }
    }

    /// Aggregate the event belongs to; assignments are keyed by user so that
    /// assign/revoke for one user publish in order.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            RbacEvent::RoleProvisioned { role, .. } | RbacEvent::RoleDeleted { role, .. } => {
                role.id
            }
            RbacEvent::RoleAssigned { assignment, .. }
            | RbacEvent::RoleRevoked { assignment, .. } => assignment.user_id,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            RbacEvent::RoleProvisioned { role, .. } | RbacEvent::RoleDeleted { role, .. } => {
                role.tenant_id
            }
            RbacEvent::RoleAssigned { assignment, .. }
            | RbacEvent::RoleRevoked { assignment, .. } => assignment.tenant_id,
        }
    }

    pub fn payload(&self) -> Payload {
        match self {
            RbacEvent::RoleProvisioned {
                role,
                permission_codes,
                provisioned_by,
            } => Payload::object()
                .with("role_id", role.id)
                .with("role_code", role.code.as_str())
                .with("name", role.name.as_str())
                .with("is_system", role.is_system)
                .with("permissions", permission_codes.clone())
                .with("provisioned_by", *provisioned_by),
            RbacEvent::RoleDeleted { role, deleted_by } => Payload::object()
                .with("role_id", role.id)
                .with("role_code", role.code.as_str())
                .with("deleted_by", *deleted_by),
            RbacEvent::RoleAssigned {
                assignment,
                role_code,
            } => Payload::object()
                .with("assignment_id", assignment.id)
                .with("user_id", assignment.user_id)
                .with("role_id", assignment.role_id)
                .with("role_code", role_code.as_str())
                .with("assigned_by", assignment.assigned_by)
                .with("assigned_at", assignment.assigned_at.to_rfc3339())
                .with("expires_at", assignment.expires_at.map(|at| at.to_rfc3339())),
            RbacEvent::RoleRevoked {
                assignment,
                role_code,
                revoked_by,
            } => Payload::object()
                .with("assignment_id", assignment.id)
                .with("user_id", assignment.user_id)
                .with("role_id", assignment.role_id)
                .with("role_code", role_code.as_str())
                .with("revoked_by", *revoked_by),
        }
    }
}

/// Subject of user creation events from the authentication service
pub const USER_CREATED_SUBJECT: &str = "auth.user.created";
/// Subject of user update events from the authentication service
pub const USER_UPDATED_SUBJECT: &str = "auth.user.updated";

/// Wire form of `auth.user.created` / `auth.user.updated`.
///
/// Identifiers arrive as strings and are validated in [`IdentityEvent::parse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEventWire {
    pub user_id: String,
    pub tenant_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Payload>,
}

/// Parsed identity lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEvent {
    pub external_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    /// When the authority observed the change, if it says so
    pub observed_at: Option<DateTime<Utc>>,
}

/// Why an inbound message could not be turned into an [`IdentityEvent`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentityEventError {
    #[error("malformed identity event: {0}")]
    Malformed(String),

    #[error("invalid {field} in identity event: {value}")]
    InvalidId { field: &'static str, value: String },

    #[error("identity event has empty email")]
    EmptyEmail,
}

impl IdentityEvent {
    pub fn parse(data: &[u8]) -> Result<Self, IdentityEventError> {
        let wire: IdentityEventWire = serde_json::from_slice(data)
            .map_err(|e| IdentityEventError::Malformed(e.to_string()))?;

        let external_id = Uuid::parse_str(&wire.user_id).map_err(|_| IdentityEventError::InvalidId {
            field: "user_id",
            value: wire.user_id.clone(),
        })?;
        let tenant_id =
            Uuid::parse_str(&wire.tenant_id).map_err(|_| IdentityEventError::InvalidId {
                field: "tenant_id",
                value: wire.tenant_id.clone(),
            })?;

        let email = wire.email.trim().to_string();
        if email.is_empty() {
            return Err(IdentityEventError::EmptyEmail);
        }

        Ok(Self {
            external_id,
            tenant_id,
            email,
            observed_at: wire.updated_at.or(wire.created_at),
        })
    }
}
