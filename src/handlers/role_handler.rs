//! Role Handler
//!
//! Provisions and removes tenant roles. Grant patterns are expanded against
//! the catalog once, at provisioning time; the materialized grants never
//! follow later catalog additions.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::authz::AuthorizationEngine;
use crate::domain::{AuthContext, DomainError, GrantPattern, Permission, RbacEvent, Role};
use crate::error::AppError;
use crate::outbox::{NewOutboxRecord, OutboxSignal};
use crate::repository::{PermissionFilter, RbacRepository};

use super::{authorize_mutation, ProvisionRoleCommand, ProvisionRoleResult};

/// Expand grant patterns against a catalog snapshot.
///
/// A concrete code absent from the catalog is an error; a wildcard matching
/// nothing contributes nothing.
pub fn expand_grants(
    grants: &[String],
    catalog: &[Permission],
) -> Result<Vec<Permission>, DomainError> {
    let mut granted: BTreeMap<String, Permission> = BTreeMap::new();

    for grant in grants {
        let pattern = GrantPattern::parse(grant)?;
        let matched: Vec<&Permission> = catalog.iter().filter(|p| pattern.matches(&p.code)).collect();

        match (&pattern, matched.is_empty()) {
            (GrantPattern::Exact(code), true) => {
                return Err(DomainError::not_found("permission", code));
            }
            (GrantPattern::Wildcard(_), true) => {
                tracing::warn!(pattern = %pattern, "Wildcard grant matched no permissions");
            }
            _ => {}
        }

        for permission in matched {
            granted
                .entry(permission.code.clone())
                .or_insert_with(|| permission.clone());
        }
    }

    Ok(granted.into_values().collect())
}

/// Handler for tenant roles
#[derive(Clone)]
pub struct RoleHandler {
    repo: Arc<dyn RbacRepository>,
    engine: AuthorizationEngine,
    signal: OutboxSignal,
}

impl RoleHandler {
    pub fn new(
        repo: Arc<dyn RbacRepository>,
        engine: AuthorizationEngine,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            repo,
            engine,
            signal,
        }
    }

    /// Create the role with its expanded grants and queue `role.provisioned`
    pub async fn provision(
        &self,
        command: ProvisionRoleCommand,
        context: &AuthContext,
    ) -> Result<ProvisionRoleResult, AppError> {
        authorize_mutation(&self.engine, context, command.tenant_id).await?;

        let code = command.code.trim();
        if code.is_empty() || command.name.trim().is_empty() {
            return Err(DomainError::Validation("role code and name are required".to_string()).into());
        }

        let catalog = self.repo.list_permissions(&PermissionFilter::default()).await?;
        let permissions = expand_grants(&command.grants, &catalog)?;

        let mut role = Role::new(command.tenant_id, code, command.name.trim());
        role.description = command.description;
        role.is_system = command.is_system;

        let event = RbacEvent::RoleProvisioned {
            role: role.clone(),
            permission_codes: permissions.iter().map(|p| p.code.clone()).collect(),
            provisioned_by: context.user_id,
        };
        let permission_ids: Vec<_> = permissions.iter().map(|p| p.id).collect();

        self.repo
            .create_role(&role, &permission_ids, &NewOutboxRecord::from_event(&event))
            .await?;
        self.signal.notify();

        tracing::info!(
            tenant_id = %role.tenant_id,
            role_id = %role.id,
            role_code = %role.code,
            grants = permission_ids.len(),
            "Role provisioned"
        );

        Ok(ProvisionRoleResult { role, permissions })
    }

    /// Delete a non-system role and queue `role.deleted`
    pub async fn delete(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        context: &AuthContext,
    ) -> Result<(), AppError> {
        authorize_mutation(&self.engine, context, tenant_id).await?;

        let role = self.get(tenant_id, role_id).await?;
        if role.is_system {
            return Err(DomainError::SystemRoleImmutable(role.code).into());
        }

        let event = RbacEvent::RoleDeleted {
            role: role.clone(),
            deleted_by: context.user_id,
        };
        self.repo
            .delete_role(tenant_id, role_id, &NewOutboxRecord::from_event(&event))
            .await?;
        self.signal.notify();

        tracing::info!(tenant_id = %tenant_id, role_code = %role.code, "Role deleted");
        Ok(())
    }

    pub async fn get(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Role, AppError> {
        self.repo
            .get_role(tenant_id, role_id)
            .await?
            .ok_or_else(|| DomainError::not_found("role", role_id).into())
    }

    pub async fn get_by_code(&self, tenant_id: Uuid, code: &str) -> Result<Role, AppError> {
        self.repo
            .get_role_by_code(tenant_id, code)
            .await?
            .ok_or_else(|| DomainError::not_found("role", code).into())
    }

    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<Role>, AppError> {
        Ok(self.repo.list_roles(tenant_id).await?)
    }

    /// Materialized grants of a role
    pub async fn permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, AppError> {
        self.get(tenant_id, role_id).await?;
        Ok(self.repo.role_permissions(tenant_id, role_id).await?)
    }
}
