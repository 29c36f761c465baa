//! Assignment Handler
//!
//! Grants and revokes tenant roles for directory users.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::authz::AuthorizationEngine;
use crate::domain::{Assignment, AuthContext, DomainError, Permission, RbacEvent, Role};
use crate::error::AppError;
use crate::outbox::{NewOutboxRecord, OutboxSignal};
use crate::repository::{AssignmentFilter, DirectoryRepository, RbacRepository};

use super::{authorize_mutation, AssignRoleCommand, RevokeRoleCommand};

/// Handler for user→role assignments
#[derive(Clone)]
pub struct AssignmentHandler {
    repo: Arc<dyn RbacRepository>,
    directory: Arc<dyn DirectoryRepository>,
    engine: AuthorizationEngine,
    signal: OutboxSignal,
}

impl AssignmentHandler {
    pub fn new(
        repo: Arc<dyn RbacRepository>,
        directory: Arc<dyn DirectoryRepository>,
        engine: AuthorizationEngine,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            repo,
            directory,
            engine,
            signal,
        }
    }

    /// Assign a role to a synced user and queue `role.assigned`.
    ///
    /// An already active assignment is a conflict; an expired one is renewed.
    /// An `expires_at` already in the past is stored as given and never
    /// resolves.
    pub async fn assign(
        &self,
        command: AssignRoleCommand,
        context: &AuthContext,
    ) -> Result<Assignment, AppError> {
        authorize_mutation(&self.engine, context, command.tenant_id).await?;
        let now = Utc::now();

        let role = self.role(command.tenant_id, command.role_id).await?;
        if self
            .directory
            .find_by_external_id(command.tenant_id, command.user_id)
            .await?
            .is_none()
        {
            return Err(DomainError::not_found("directory user", command.user_id).into());
        }

        let assignment = Assignment {
            id: Uuid::new_v4(),
            tenant_id: command.tenant_id,
            user_id: command.user_id,
            role_id: role.id,
            assigned_by: context.user_id,
            assigned_at: now,
            expires_at: command.expires_at,
        };
        let event = RbacEvent::RoleAssigned {
            assignment: assignment.clone(),
            role_code: role.code.clone(),
        };

        let saved = self
            .repo
            .save_assignment(&assignment, now, &NewOutboxRecord::from_event(&event))
            .await?;
        self.signal.notify();

        tracing::info!(
            tenant_id = %saved.tenant_id,
            user_id = %saved.user_id,
            role_code = %role.code,
            assigned_by = %saved.assigned_by,
            "Role assigned"
        );
        Ok(saved)
    }

    /// Remove an assignment and queue `role.revoked`
    pub async fn revoke(
        &self,
        command: RevokeRoleCommand,
        context: &AuthContext,
    ) -> Result<Assignment, AppError> {
        authorize_mutation(&self.engine, context, command.tenant_id).await?;

        let role = self.role(command.tenant_id, command.role_id).await?;
        let assignment = self
            .repo
            .find_assignment(command.tenant_id, command.user_id, command.role_id)
            .await?
            .ok_or_else(|| {
                DomainError::not_found(
                    "assignment",
                    format!("{}/{}", command.user_id, role.code),
                )
            })?;

        let event = RbacEvent::RoleRevoked {
            assignment: assignment.clone(),
            role_code: role.code.clone(),
            revoked_by: context.user_id,
        };
        self.repo
            .delete_assignment(
                command.tenant_id,
                assignment.id,
                &NewOutboxRecord::from_event(&event),
            )
            .await?;
        self.signal.notify();

        tracing::info!(
            tenant_id = %command.tenant_id,
            user_id = %command.user_id,
            role_code = %role.code,
            "Role revoked"
        );
        Ok(assignment)
    }

    pub async fn list(
        &self,
        tenant_id: Uuid,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>, AppError> {
        Ok(self.repo.list_assignments(tenant_id, filter).await?)
    }

    /// Roles held through currently active assignments
    pub async fn user_roles(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<Role>, AppError> {
        let now = Utc::now();
        let filter = AssignmentFilter {
            user_id: Some(user_id),
            role_id: None,
        };

        let mut roles = Vec::new();
        for assignment in self.repo.list_assignments(tenant_id, &filter).await? {
            if !assignment.is_active_at(now) {
                continue;
            }
            if let Some(role) = self.repo.get_role(tenant_id, assignment.role_id).await? {
                roles.push(role);
            }
        }
        roles.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(roles)
    }

    /// Union of the grants of the user's active roles
    pub async fn user_permissions(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Permission>, AppError> {
        let mut permissions = BTreeMap::new();
        for role in self.user_roles(tenant_id, user_id).await? {
            for permission in self.repo.role_permissions(tenant_id, role.id).await? {
                permissions.entry(permission.code.clone()).or_insert(permission);
            }
        }
        Ok(permissions.into_values().collect())
    }

    async fn role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Role, AppError> {
        self.repo
            .get_role(tenant_id, role_id)
            .await?
            .ok_or_else(|| DomainError::not_found("role", role_id).into())
    }
}
