//! Authorization Engine
//!
//! Resolves permission and role checks for an authenticated identity by
//! walking active assignments to roles to catalog codes.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::AuthContext;
use crate::error::AppError;
use crate::repository::{AuthorizationRepository, StoreError};

/// Authorization failures that are not a plain "no"
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// The store could not answer; callers must deny
    #[error("Authorization indeterminate: {0}")]
    Indeterminate(#[source] StoreError),
}

/// Permission and role resolution over an [`AuthorizationRepository`]
#[derive(Clone)]
pub struct AuthorizationEngine {
    repo: Arc<dyn AuthorizationRepository>,
}

impl AuthorizationEngine {
    pub fn new(repo: Arc<dyn AuthorizationRepository>) -> Self {
        Self { repo }
    }

    /// Whether the identity holds `code` through an active assignment.
    ///
    /// Superusers are granted without touching the store.
    pub async fn check_permission(
        &self,
        identity: &AuthContext,
        code: &str,
    ) -> Result<bool, AuthzError> {
        self.check_permission_at(identity, code, Utc::now()).await
    }

    pub async fn check_permission_at(
        &self,
        identity: &AuthContext,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthzError> {
        if identity.is_superuser() {
            return Ok(true);
        }

        let codes = self
            .repo
            .active_permission_codes(identity.tenant_id, identity.user_id, at)
            .await
            .map_err(AuthzError::Indeterminate)?;

        Ok(codes.iter().any(|granted| granted == code))
    }

    /// Whether the identity holds the role `role_code` through an active assignment
    pub async fn check_role(
        &self,
        identity: &AuthContext,
        role_code: &str,
    ) -> Result<bool, AuthzError> {
        self.check_role_at(identity, role_code, Utc::now()).await
    }

    pub async fn check_role_at(
        &self,
        identity: &AuthContext,
        role_code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthzError> {
        if identity.is_superuser() {
            return Ok(true);
        }

        let roles = self
            .repo
            .active_roles(identity.tenant_id, identity.user_id, at)
            .await
            .map_err(AuthzError::Indeterminate)?;

        Ok(roles.iter().any(|role| role.code == role_code))
    }

    /// Resolved, de-duplicated permission codes
    pub async fn effective_permissions(
        &self,
        identity: &AuthContext,
    ) -> Result<BTreeSet<String>, AuthzError> {
        let codes = self
            .repo
            .active_permission_codes(identity.tenant_id, identity.user_id, Utc::now())
            .await
            .map_err(AuthzError::Indeterminate)?;

        Ok(codes.into_iter().collect())
    }

    /// Resolved, de-duplicated role codes
    pub async fn effective_roles(
        &self,
        identity: &AuthContext,
    ) -> Result<BTreeSet<String>, AuthzError> {
        let roles = self
            .repo
            .active_roles(identity.tenant_id, identity.user_id, Utc::now())
            .await
            .map_err(AuthzError::Indeterminate)?;

        Ok(roles.into_iter().map(|role| role.code).collect())
    }

    /// Deny with Forbidden unless the identity holds `code`
    pub async fn require_permission(
        &self,
        identity: &AuthContext,
        code: &str,
    ) -> Result<(), AppError> {
        match self.check_permission(identity, code).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(
                    tenant_id = %identity.tenant_id,
                    user_id = %identity.user_id,
                    permission = code,
                    "Permission denied"
                );
                Err(AppError::Forbidden(format!("missing permission '{}'", code)))
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %identity.tenant_id,
                    user_id = %identity.user_id,
                    permission = code,
                    error = %e,
                    "Permission check failed"
                );
                Err(AppError::AuthorizationIndeterminate)
            }
        }
    }

    /// Deny with Forbidden unless the identity holds `role_code`
    pub async fn require_role(
        &self,
        identity: &AuthContext,
        role_code: &str,
    ) -> Result<(), AppError> {
        match self.check_role(identity, role_code).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(
                    tenant_id = %identity.tenant_id,
                    user_id = %identity.user_id,
                    role = role_code,
                    "Role denied"
                );
                Err(AppError::Forbidden(format!("missing role '{}'", role_code)))
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %identity.tenant_id,
                    user_id = %identity.user_id,
                    role = role_code,
                    error = %e,
                    "Role check failed"
                );
                Err(AppError::AuthorizationIndeterminate)
            }
        }
    }
}
