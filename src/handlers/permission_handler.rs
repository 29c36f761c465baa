//! Permission Catalog Handler
//!
//! Global catalog of permission codes.

use std::sync::Arc;

use crate::domain::{DomainError, NewPermission, Permission};
use crate::error::AppError;
use crate::repository::{PermissionFilter, RbacRepository};

/// Handler for catalog management
#[derive(Clone)]
pub struct PermissionHandler {
    repo: Arc<dyn RbacRepository>,
}

impl PermissionHandler {
    pub fn new(repo: Arc<dyn RbacRepository>) -> Self {
        Self { repo }
    }

    /// Add a permission; duplicate codes are rejected with Conflict
    pub async fn create(&self, permission: NewPermission) -> Result<Permission, AppError> {
        let permission = permission.into_permission()?;
        self.repo.insert_permission(&permission).await?;

        tracing::info!(code = %permission.code, module = %permission.module, "Permission created");
        Ok(permission)
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Permission, AppError> {
        self.repo
            .get_permission_by_code(code)
            .await?
            .ok_or_else(|| DomainError::not_found("permission", code).into())
    }

    pub async fn list(&self, filter: &PermissionFilter) -> Result<Vec<Permission>, AppError> {
        Ok(self.repo.list_permissions(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let handler = PermissionHandler::new(Arc::new(InMemoryStore::new()));
        handler
            .create(NewPermission::new("treasury.banking.import", "Import", "banking", "import"))
            .await
            .unwrap();

        let found = handler.get_by_code("treasury.banking.import").await.unwrap();
        assert_eq!(found.action, "import");

        let missing = handler.get_by_code("treasury.banking.export").await;
        assert!(matches!(missing, Err(AppError::Domain(DomainError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_codes() {
        let handler = PermissionHandler::new(Arc::new(InMemoryStore::new()));
        let perm = || NewPermission::new("treasury.ledger.view", "View", "ledger", "view");
        handler.create(perm()).await.unwrap();

        assert!(matches!(handler.create(perm()).await, Err(AppError::Conflict(_))));

        let invalid = handler
            .create(NewPermission::new("treasury.*", "All", "treasury", "all"))
            .await;
        assert!(matches!(
            invalid,
            Err(AppError::Domain(DomainError::InvalidPermissionCode(_)))
        ));
    }
}
