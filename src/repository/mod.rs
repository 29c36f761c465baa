//! Repository module
//!
//! Persistence ports for the permission catalog, role graph, assignment
//! store and directory shadow, with PostgreSQL and in-memory adapters.
//!
//! Every RBAC mutation takes the outbox record describing it; adapters write
//! both in one transaction.

mod error;
mod memory;
mod postgres;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::{PgDirectoryRepository, PgRbacRepository};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Assignment, DirectoryUser, Permission, Role};
use crate::outbox::NewOutboxRecord;

/// Catalog listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionFilter {
    pub module: Option<String>,
    pub action: Option<String>,
}

impl PermissionFilter {
    pub fn module(module: &str) -> Self {
        Self {
            module: Some(module.to_string()),
            action: None,
        }
    }

    pub fn matches(&self, permission: &Permission) -> bool {
        self.module.as_ref().map_or(true, |m| &permission.module == m)
            && self.action.as_ref().map_or(true, |a| &permission.action == a)
    }
}

/// Assignment listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentFilter {
    pub user_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
}

impl AssignmentFilter {
    pub fn matches(&self, assignment: &Assignment) -> bool {
        self.user_id.map_or(true, |id| assignment.user_id == id)
            && self.role_id.map_or(true, |id| assignment.role_id == id)
    }
}

/// Read side consulted by the authorization engine
#[async_trait]
pub trait AuthorizationRepository: Send + Sync {
    /// Roles held through assignments active at `at`
    async fn active_roles(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Role>, StoreError>;

    /// Distinct permission codes granted through roles active at `at`
    async fn active_permission_codes(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;
}

/// Permission catalog, role graph and assignment store
#[async_trait]
pub trait RbacRepository: Send + Sync {
    /// Insert a catalog entry; a duplicate code is a conflict
    async fn insert_permission(&self, permission: &Permission) -> Result<(), StoreError>;

    async fn get_permission_by_code(&self, code: &str) -> Result<Option<Permission>, StoreError>;

    /// Catalog entries ordered by code
    async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, StoreError>;

    /// Insert a role with its grants and the `role.provisioned` record
    async fn create_role(
        &self,
        role: &Role,
        permission_ids: &[Uuid],
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError>;

    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Option<Role>, StoreError>;

    async fn get_role_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Role>, StoreError>;

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>, StoreError>;

    /// Permissions granted to a role, ordered by code
    async fn role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, StoreError>;

    /// Remove a non-system role, its grants and assignments
    async fn delete_role(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError>;

    /// Insert an assignment.
    ///
    /// An existing (tenant, user, role) row is replaced only when it expired
    /// at or before `now`; otherwise the call is a conflict.
    async fn save_assignment(
        &self,
        assignment: &Assignment,
        now: DateTime<Utc>,
        outbox: &NewOutboxRecord,
    ) -> Result<Assignment, StoreError>;

    async fn find_assignment(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError>;

    /// Delete an assignment by id and append the `role.revoked` record
    async fn delete_assignment(
        &self,
        tenant_id: Uuid,
        assignment_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError>;

    /// Assignments ordered by assigned_at, expired ones included
    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>, StoreError>;
}

/// Directory shadow storage
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<Option<DirectoryUser>, StoreError>;

    async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<DirectoryUser>, StoreError>;

    /// Create or refresh the (tenant, external_id) row in one atomic step.
    ///
    /// The email only moves forward when `observed_at` is not older than the
    /// stored `last_sync_at`.
    async fn upsert_synced(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
        email: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<DirectoryUser, StoreError>;

    async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<DirectoryUser>, StoreError>;
}
