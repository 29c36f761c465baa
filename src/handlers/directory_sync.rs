//! Directory Sync Service
//!
//! Single idempotent entry point for mirroring identities owned by the
//! authentication service. Used by direct calls and by the inbound identity
//! event consumer alike. Emits no outbound events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{DirectoryUser, DomainError};
use crate::error::AppError;
use crate::repository::DirectoryRepository;

use super::SyncUserCommand;

/// Directory shadow maintenance
#[derive(Clone)]
pub struct DirectorySyncService {
    repo: Arc<dyn DirectoryRepository>,
}

impl DirectorySyncService {
    pub fn new(repo: Arc<dyn DirectoryRepository>) -> Self {
        Self { repo }
    }

    /// Create or refresh the (tenant, external_id) shadow row as of now
    pub async fn sync_user(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
        email: &str,
    ) -> Result<DirectoryUser, AppError> {
        self.sync_user_at(tenant_id, external_id, email, Utc::now())
            .await
    }

    /// Create or refresh the shadow row as observed at `observed_at`.
    ///
    /// Re-syncs older than the stored `last_sync_at` leave the email untouched.
    pub async fn sync_user_at(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
        email: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<DirectoryUser, AppError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(DomainError::Validation("email is required".to_string()).into());
        }

        let user = self
            .repo
            .upsert_synced(tenant_id, external_id, email, observed_at)
            .await?;

        tracing::debug!(
            tenant_id = %tenant_id,
            external_id = %external_id,
            user_id = %user.id,
            "Directory user synced"
        );
        Ok(user)
    }

    pub async fn execute(&self, command: SyncUserCommand) -> Result<DirectoryUser, AppError> {
        match command.observed_at {
            Some(at) => {
                self.sync_user_at(command.tenant_id, command.external_id, &command.email, at)
                    .await
            }
            None => {
                self.sync_user(command.tenant_id, command.external_id, &command.email)
                    .await
            }
        }
    }

    pub async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<DirectoryUser, AppError> {
        self.repo
            .find_by_external_id(tenant_id, external_id)
            .await?
            .ok_or_else(|| DomainError::not_found("directory user", external_id).into())
    }

    pub async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<DirectoryUser, AppError> {
        self.repo
            .get_user(tenant_id, id)
            .await?
            .ok_or_else(|| DomainError::not_found("directory user", id).into())
    }

    pub async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<DirectoryUser>, AppError> {
        Ok(self.repo.list_users(tenant_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SyncStatus;
    use crate::repository::InMemoryStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_sync_twice_keeps_one_row() {
        let service = DirectorySyncService::new(Arc::new(InMemoryStore::new()));
        let (tenant, external) = (Uuid::new_v4(), Uuid::new_v4());

        let first = service.sync_user(tenant, external, "ana@acme.io").await.unwrap();
        let second = service.sync_user(tenant, external, "ana@acme.io").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.sync_status, SyncStatus::Synced);
        assert_eq!(service.list_users(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_older_update_does_not_overwrite_email() {
        let service = DirectorySyncService::new(Arc::new(InMemoryStore::new()));
        let (tenant, external) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();

        service.sync_user_at(tenant, external, "new@acme.io", t0).await.unwrap();
        let user = service
            .sync_user_at(tenant, external, "old@acme.io", t0 - Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(user.email, "new@acme.io");
        assert_eq!(user.last_sync_at, Some(t0));
    }

    #[tokio::test]
    async fn test_same_external_id_in_two_tenants() {
        let service = DirectorySyncService::new(Arc::new(InMemoryStore::new()));
        let external = Uuid::new_v4();

        let a = service.sync_user(Uuid::new_v4(), external, "x@acme.io").await.unwrap();
        let b = service.sync_user(Uuid::new_v4(), external, "x@acme.io").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_empty_email_rejected() {
        let service = DirectorySyncService::new(Arc::new(InMemoryStore::new()));
        let result = service.sync_user(Uuid::new_v4(), Uuid::new_v4(), "  ").await;
        assert!(matches!(result, Err(AppError::Domain(DomainError::Validation(_)))));
    }
}
