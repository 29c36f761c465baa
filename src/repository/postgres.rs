//! PostgreSQL repositories
//!
//! RBAC and directory tables. Every RBAC mutation opens one transaction,
//! writes its rows, appends the outbox record through
//! [`PgOutboxStore::append`] and commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Assignment, DirectoryUser, Permission, Role};
use crate::outbox::{NewOutboxRecord, PgOutboxStore};

use super::{
    AssignmentFilter, AuthorizationRepository, DirectoryRepository, PermissionFilter,
    RbacRepository, StoreError,
};

// =========================================================================
// Row mapping
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct PermissionRow {
    id: Uuid,
    code: String,
    name: String,
    module: String,
    action: String,
    resource: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<PermissionRow> for Permission {
    fn from(row: PermissionRow) -> Self {
        Permission {
            id: row.id,
            code: row.code,
            name: row.name,
            module: row.module,
            action: row.action,
            resource: row.resource,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    tenant_id: Uuid,
    code: String,
    name: String,
    description: Option<String>,
    is_system: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            tenant_id: row.tenant_id,
            code: row.code,
            name: row.name,
            description: row.description,
            is_system: row.is_system,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    role_id: Uuid,
    assigned_by: Uuid,
    assigned_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<AssignmentRow> for Assignment {
    fn from(row: AssignmentRow) -> Self {
        Assignment {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            role_id: row.role_id,
            assigned_by: row.assigned_by,
            assigned_at: row.assigned_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DirectoryUserRow {
    id: Uuid,
    tenant_id: Uuid,
    external_id: Uuid,
    email: String,
    status: String,
    sync_status: String,
    last_sync_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DirectoryUserRow> for DirectoryUser {
    type Error = StoreError;

    fn try_from(row: DirectoryUserRow) -> Result<Self, Self::Error> {
        Ok(DirectoryUser {
            id: row.id,
            tenant_id: row.tenant_id,
            external_id: row.external_id,
            email: row.email,
            status: row
                .status
                .parse()
                .map_err(|e: crate::domain::DomainError| StoreError::InvalidData(e.to_string()))?,
            sync_status: row
                .sync_status
                .parse()
                .map_err(|e: crate::domain::DomainError| StoreError::InvalidData(e.to_string()))?,
            last_sync_at: row.last_sync_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PERMISSION_COLUMNS: &str =
    "p.id, p.code, p.name, p.module, p.action, p.resource, p.description, p.created_at";
const ROLE_COLUMNS: &str =
    "r.id, r.tenant_id, r.code, r.name, r.description, r.is_system, r.created_at, r.updated_at";
const ASSIGNMENT_COLUMNS: &str =
    "id, tenant_id, user_id, role_id, assigned_by, assigned_at, expires_at";
const DIRECTORY_USER_COLUMNS: &str = "id, tenant_id, external_id, email, status, sync_status, \
     last_sync_at, created_at, updated_at";

// =========================================================================
// RBAC repository
// =========================================================================

/// Permission catalog, role graph and assignments on PostgreSQL
#[derive(Debug, Clone)]
pub struct PgRbacRepository {
    pool: PgPool,
}

impl PgRbacRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthorizationRepository for PgRbacRepository {
    async fn active_roles(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Role>, StoreError> {
        let rows: Vec<RoleRow> = sqlx::query_as(&format!(
            r#"
            SELECT DISTINCT {ROLE_COLUMNS}
            FROM assignments a
            INNER JOIN roles r ON r.id = a.role_id AND r.tenant_id = a.tenant_id
            WHERE a.tenant_id = $1
              AND a.user_id = $2
              AND (a.expires_at IS NULL OR a.expires_at > $3)
            ORDER BY r.code
            "#
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn active_permission_codes(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let codes: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT p.code
            FROM assignments a
            INNER JOIN role_permissions rp ON rp.role_id = a.role_id
            INNER JOIN permissions p ON p.id = rp.permission_id
            WHERE a.tenant_id = $1
              AND a.user_id = $2
              AND (a.expires_at IS NULL OR a.expires_at > $3)
            ORDER BY p.code
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(codes)
    }
}

#[async_trait]
impl RbacRepository for PgRbacRepository {
    async fn insert_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, code, name, module, action, resource, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(permission.id)
        .bind(&permission.code)
        .bind(&permission.name)
        .bind(&permission.module)
        .bind(&permission.action)
        .bind(&permission.resource)
        .bind(&permission.description)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_permission_by_code(&self, code: &str) -> Result<Option<Permission>, StoreError> {
        let row: Option<PermissionRow> = sqlx::query_as(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions p WHERE p.code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Permission::from))
    }

    async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, StoreError> {
        let rows: Vec<PermissionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            WHERE ($1::text IS NULL OR p.module = $1)
              AND ($2::text IS NULL OR p.action = $2)
            ORDER BY p.code
            "#
        ))
        .bind(&filter.module)
        .bind(&filter.action)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permission::from).collect())
    }

    async fn create_role(
        &self,
        role: &Role,
        permission_ids: &[Uuid],
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO roles (id, tenant_id, code, name, description, is_system, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(&role.code)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&mut *tx)
        .await?;

        if !permission_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO role_permissions (role_id, permission_id)
                SELECT $1, UNNEST($2::uuid[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role.id)
            .bind(permission_ids)
            .execute(&mut *tx)
            .await?;
        }

        PgOutboxStore::append(&mut tx, outbox).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        let row: Option<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.tenant_id = $1 AND r.id = $2"
        ))
        .bind(tenant_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Role::from))
    }

    async fn get_role_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Role>, StoreError> {
        let row: Option<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.tenant_id = $1 AND r.code = $2"
        ))
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Role::from))
    }

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>, StoreError> {
        let rows: Vec<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.tenant_id = $1 ORDER BY r.code"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, StoreError> {
        let rows: Vec<PermissionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM role_permissions rp
            INNER JOIN roles r ON r.id = rp.role_id
            INNER JOIN permissions p ON p.id = rp.permission_id
            WHERE r.tenant_id = $1 AND r.id = $2
            ORDER BY p.code
            "#
        ))
        .bind(tenant_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permission::from).collect())
    }

    async fn delete_role(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String, bool)> = sqlx::query_as(
            "SELECT code, is_system FROM roles WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            None => return Err(StoreError::not_found("role", role_id)),
            Some((code, true)) => {
                return Err(StoreError::Conflict(format!(
                    "system role '{}' cannot be deleted",
                    code
                )))
            }
            Some(_) => {}
        }

        // role_permissions and assignments cascade
        sqlx::query("DELETE FROM roles WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        PgOutboxStore::append(&mut tx, outbox).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn save_assignment(
        &self,
        assignment: &Assignment,
        now: DateTime<Utc>,
        outbox: &NewOutboxRecord,
    ) -> Result<Assignment, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<AssignmentRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO assignments (id, tenant_id, user_id, role_id, assigned_by, assigned_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, user_id, role_id) DO UPDATE
            SET id = EXCLUDED.id,
                assigned_by = EXCLUDED.assigned_by,
                assigned_at = EXCLUDED.assigned_at,
                expires_at = EXCLUDED.expires_at
            WHERE assignments.expires_at IS NOT NULL AND assignments.expires_at <= $8
            RETURNING {ASSIGNMENT_COLUMNS}
            "#
        ))
        .bind(assignment.id)
        .bind(assignment.tenant_id)
        .bind(assignment.user_id)
        .bind(assignment.role_id)
        .bind(assignment.assigned_by)
        .bind(assignment.assigned_at)
        .bind(assignment.expires_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::Conflict(format!(
                "role {} already assigned to user {}",
                assignment.role_id, assignment.user_id
            )));
        };

        PgOutboxStore::append(&mut tx, outbox).await?;
        tx.commit().await?;

        Ok(row.into())
    }

    async fn find_assignment(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError> {
        let row: Option<AssignmentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS}
            FROM assignments
            WHERE tenant_id = $1 AND user_id = $2 AND role_id = $3
            "#
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Assignment::from))
    }

    async fn delete_assignment(
        &self,
        tenant_id: Uuid,
        assignment_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM assignments WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(assignment_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("assignment", assignment_id));
        }

        PgOutboxStore::append(&mut tx, outbox).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>, StoreError> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS}
            FROM assignments
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::uuid IS NULL OR role_id = $3)
            ORDER BY assigned_at
            "#
        ))
        .bind(tenant_id)
        .bind(filter.user_id)
        .bind(filter.role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Assignment::from).collect())
    }
}

// =========================================================================
// Directory repository
// =========================================================================

/// Directory shadow on PostgreSQL
#[derive(Debug, Clone)]
pub struct PgDirectoryRepository {
    pool: PgPool,
}

impl PgDirectoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DirectoryRepository for PgDirectoryRepository {
    async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<Option<DirectoryUser>, StoreError> {
        let row: Option<DirectoryUserRow> = sqlx::query_as(&format!(
            "SELECT {DIRECTORY_USER_COLUMNS} FROM directory_users WHERE tenant_id = $1 AND external_id = $2"
        ))
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DirectoryUser::try_from).transpose()
    }

    async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<DirectoryUser>, StoreError> {
        let row: Option<DirectoryUserRow> = sqlx::query_as(&format!(
            "SELECT {DIRECTORY_USER_COLUMNS} FROM directory_users WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DirectoryUser::try_from).transpose()
    }

    async fn upsert_synced(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
        email: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<DirectoryUser, StoreError> {
        let row: DirectoryUserRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO directory_users (
                id, tenant_id, external_id, email, status, sync_status,
                last_sync_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'active', 'synced', $5, $5, $5)
            ON CONFLICT (tenant_id, external_id) DO UPDATE
            SET email = CASE
                    WHEN directory_users.last_sync_at IS NULL
                      OR EXCLUDED.last_sync_at >= directory_users.last_sync_at
                    THEN EXCLUDED.email
                    ELSE directory_users.email
                END,
                last_sync_at = GREATEST(directory_users.last_sync_at, EXCLUDED.last_sync_at),
                sync_status = 'synced',
                updated_at = NOW()
            RETURNING {DIRECTORY_USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(external_id)
        .bind(email)
        .bind(observed_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<DirectoryUser>, StoreError> {
        let rows: Vec<DirectoryUserRow> = sqlx::query_as(&format!(
            "SELECT {DIRECTORY_USER_COLUMNS} FROM directory_users WHERE tenant_id = $1 ORDER BY email"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DirectoryUser::try_from).collect()
    }
}
