//! In-memory store
//!
//! All tables live behind one mutex, so every mutation together with its
//! outbox append is a single critical section. Used by tests and embedders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Assignment, DirectoryUser, Permission, Role, RolePermission};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxRecord, OutboxRepository, OutboxStatus};

use super::{
    AssignmentFilter, AuthorizationRepository, DirectoryRepository, PermissionFilter,
    RbacRepository, StoreError,
};

#[derive(Debug, Default)]
struct Tables {
    /// Keyed by code
    permissions: BTreeMap<String, Permission>,
    roles: HashMap<Uuid, Role>,
    role_permissions: BTreeSet<RolePermission>,
    assignments: HashMap<Uuid, Assignment>,
    users: HashMap<Uuid, DirectoryUser>,
    outbox: Vec<OutboxRecord>,
    next_sequence: i64,
}

impl Tables {
    fn append(&mut self, record: &NewOutboxRecord) -> OutboxRecord {
        self.next_sequence += 1;
        let stored = OutboxRecord::from_new(record.clone(), self.next_sequence);
        self.outbox.push(stored.clone());
        stored
    }

    fn permission_by_id(&self, id: Uuid) -> Option<&Permission> {
        self.permissions.values().find(|p| p.id == id)
    }

    fn active_role_ids(&self, tenant_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Vec<Uuid> {
        self.assignments
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.user_id == user_id && a.is_active_at(at))
            .map(|a| a.role_id)
            .collect()
    }

    fn outbox_entry(&mut self, id: Uuid) -> Result<&mut OutboxRecord, OutboxError> {
        let record = self
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;

        if record.status.is_terminal() {
            return Err(OutboxError::InvalidTransition {
                id,
                status: record.status,
            });
        }
        Ok(record)
    }
}

/// In-memory implementation of every store port
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    authorization_lookups: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the database were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of authorization reads served so far
    pub fn authorization_lookups(&self) -> usize {
        self.authorization_lookups.load(Ordering::SeqCst)
    }

    /// Append an outbox record as a single-statement transaction
    pub async fn append(&self, record: &NewOutboxRecord) -> Result<OutboxRecord, OutboxError> {
        self.outbox_guard()?;
        Ok(self.tables.lock().await.append(record))
    }

    /// Snapshot of the outbox in insertion order
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.tables.lock().await.outbox.clone()
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn outbox_guard(&self) -> Result<(), OutboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

// =========================================================================
// Authorization reads
// =========================================================================

#[async_trait]
impl AuthorizationRepository for InMemoryStore {
    async fn active_roles(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<Role>, StoreError> {
        self.authorization_lookups.fetch_add(1, Ordering::SeqCst);
        self.guard()?;
        let tables = self.tables.lock().await;

        let mut roles: Vec<Role> = tables
            .active_role_ids(tenant_id, user_id, at)
            .into_iter()
            .filter_map(|id| tables.roles.get(&id).cloned())
            .collect();
        roles.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(roles)
    }

    async fn active_permission_codes(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.authorization_lookups.fetch_add(1, Ordering::SeqCst);
        self.guard()?;
        let tables = self.tables.lock().await;

        let role_ids: BTreeSet<Uuid> = tables
            .active_role_ids(tenant_id, user_id, at)
            .into_iter()
            .collect();
        let codes: BTreeSet<String> = tables
            .role_permissions
            .iter()
            .filter(|grant| role_ids.contains(&grant.role_id))
            .filter_map(|grant| tables.permission_by_id(grant.permission_id))
            .map(|p| p.code.clone())
            .collect();
        Ok(codes.into_iter().collect())
    }
}

// =========================================================================
// Catalog, roles, assignments
// =========================================================================

#[async_trait]
impl RbacRepository for InMemoryStore {
    async fn insert_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        if tables.permissions.contains_key(&permission.code) {
            return Err(StoreError::Conflict(format!(
                "permission '{}' already exists",
                permission.code
            )));
        }
        tables
            .permissions
            .insert(permission.code.clone(), permission.clone());
        Ok(())
    }

    async fn get_permission_by_code(&self, code: &str) -> Result<Option<Permission>, StoreError> {
        self.guard()?;
        Ok(self.tables.lock().await.permissions.get(code).cloned())
    }

    async fn list_permissions(
        &self,
        filter: &PermissionFilter,
    ) -> Result<Vec<Permission>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .permissions
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn create_role(
        &self,
        role: &Role,
        permission_ids: &[Uuid],
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        let duplicate = tables
            .roles
            .values()
            .any(|r| r.tenant_id == role.tenant_id && r.code == role.code);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "role '{}' already exists in tenant {}",
                role.code, role.tenant_id
            )));
        }
        if let Some(missing) = permission_ids
            .iter()
            .find(|id| tables.permission_by_id(**id).is_none())
        {
            return Err(StoreError::not_found("permission", missing));
        }

        tables.roles.insert(role.id, role.clone());
        for permission_id in permission_ids {
            tables.role_permissions.insert(RolePermission {
                role_id: role.id,
                permission_id: *permission_id,
            });
        }
        tables.append(outbox);
        Ok(())
    }

    async fn get_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .roles
            .get(&role_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_role_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Role>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .roles
            .values()
            .find(|r| r.tenant_id == tenant_id && r.code == code)
            .cloned())
    }

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        let mut roles: Vec<Role> = tables
            .roles
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(roles)
    }

    async fn role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;

        if !tables
            .roles
            .get(&role_id)
            .is_some_and(|r| r.tenant_id == tenant_id)
        {
            return Ok(Vec::new());
        }

        let mut permissions: Vec<Permission> = tables
            .role_permissions
            .iter()
            .filter(|grant| grant.role_id == role_id)
            .filter_map(|grant| tables.permission_by_id(grant.permission_id).cloned())
            .collect();
        permissions.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(permissions)
    }

    async fn delete_role(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        match tables.roles.get(&role_id) {
            Some(role) if role.tenant_id == tenant_id => {
                if role.is_system {
                    return Err(StoreError::Conflict(format!(
                        "system role '{}' cannot be deleted",
                        role.code
                    )));
                }
            }
            _ => return Err(StoreError::not_found("role", role_id)),
        }

        tables.roles.remove(&role_id);
        tables.role_permissions.retain(|grant| grant.role_id != role_id);
        tables.assignments.retain(|_, a| a.role_id != role_id);
        tables.append(outbox);
        Ok(())
    }

    async fn save_assignment(
        &self,
        assignment: &Assignment,
        now: DateTime<Utc>,
        outbox: &NewOutboxRecord,
    ) -> Result<Assignment, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        let existing = tables
            .assignments
            .values()
            .find(|a| {
                a.tenant_id == assignment.tenant_id
                    && a.user_id == assignment.user_id
                    && a.role_id == assignment.role_id
            })
            .cloned();

        if let Some(existing) = existing {
            if existing.is_active_at(now) {
                return Err(StoreError::Conflict(format!(
                    "role {} already assigned to user {}",
                    assignment.role_id, assignment.user_id
                )));
            }
            tables.assignments.remove(&existing.id);
        }

        tables.assignments.insert(assignment.id, assignment.clone());
        tables.append(outbox);
        Ok(assignment.clone())
    }

    async fn find_assignment(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .assignments
            .values()
            .find(|a| a.tenant_id == tenant_id && a.user_id == user_id && a.role_id == role_id)
            .cloned())
    }

    async fn delete_assignment(
        &self,
        tenant_id: Uuid,
        assignment_id: Uuid,
        outbox: &NewOutboxRecord,
    ) -> Result<(), StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        let owned = tables
            .assignments
            .get(&assignment_id)
            .is_some_and(|a| a.tenant_id == tenant_id);
        if !owned {
            return Err(StoreError::not_found("assignment", assignment_id));
        }

        tables.assignments.remove(&assignment_id);
        tables.append(outbox);
        Ok(())
    }

    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        let mut assignments: Vec<Assignment> = tables
            .assignments
            .values()
            .filter(|a| a.tenant_id == tenant_id && filter.matches(a))
            .cloned()
            .collect();
        assignments.sort_by_key(|a| a.assigned_at);
        Ok(assignments)
    }
}

// =========================================================================
// Directory shadow
// =========================================================================

#[async_trait]
impl DirectoryRepository for InMemoryStore {
    async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
    ) -> Result<Option<DirectoryUser>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.tenant_id == tenant_id && u.external_id == external_id)
            .cloned())
    }

    async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<DirectoryUser>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .get(&id)
            .filter(|u| u.tenant_id == tenant_id)
            .cloned())
    }

    async fn upsert_synced(
        &self,
        tenant_id: Uuid,
        external_id: Uuid,
        email: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<DirectoryUser, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock().await;

        let existing = tables
            .users
            .values()
            .find(|u| u.tenant_id == tenant_id && u.external_id == external_id)
            .map(|u| u.id);

        match existing.and_then(|id| tables.users.get_mut(&id)) {
            Some(user) => {
                user.apply_sync(email, observed_at);
                Ok(user.clone())
            }
            None => {
                let user =
                    DirectoryUser::synced(tenant_id, external_id, email.to_string(), observed_at);
                tables.users.insert(user.id, user.clone());
                Ok(user)
            }
        }
    }

    async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<DirectoryUser>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock().await;
        let mut users: Vec<DirectoryUser> = tables
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }
}

// =========================================================================
// Outbox
// =========================================================================

#[async_trait]
impl OutboxRepository for InMemoryStore {
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.outbox_guard()?;
        let tables = self.tables.lock().await;

        let mut pending: Vec<OutboxRecord> = tables
            .outbox
            .iter()
            .filter(|r| r.is_deliverable())
            .cloned()
            .collect();
        pending.sort_by_key(OutboxRecord::order_key);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.outbox_guard()?;
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        let mut candidates: Vec<usize> = (0..tables.outbox.len())
            .filter(|&i| tables.outbox[i].is_deliverable())
            .collect();
        candidates.sort_by_key(|&i| tables.outbox[i].order_key());

        let blocked = |record: &OutboxRecord, all: &[OutboxRecord]| {
            all.iter().any(|older| {
                older.aggregate_type == record.aggregate_type
                    && older.aggregate_id == record.aggregate_id
                    && older.is_deliverable()
                    && older.is_leased_at(now)
                    && older.order_key() < record.order_key()
            })
        };

        let selected: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| {
                let record = &tables.outbox[i];
                !record.is_leased_at(now) && !blocked(record, &tables.outbox)
            })
            .take(limit)
            .collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for i in selected {
            let record = &mut tables.outbox[i];
            record.locked_by = Some(relay_id.to_string());
            record.locked_until = Some(now + lease);
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    async fn release(&self, id: Uuid) -> Result<(), OutboxError> {
        self.outbox_guard()?;
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.id == id) {
            record.locked_by = None;
            record.locked_until = None;
        }
        Ok(())
    }

    async fn mark_published(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError> {
        self.outbox_guard()?;
        let mut tables = self.tables.lock().await;
        let record = tables.outbox_entry(id)?;
        record.status = OutboxStatus::Published;
        record.published_at = Some(when);
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        when: DateTime<Utc>,
    ) -> Result<i32, OutboxError> {
        self.outbox_guard()?;
        let mut tables = self.tables.lock().await;
        let record = tables.outbox_entry(id)?;
        record.status = OutboxStatus::Failed;
        record.attempts += 1;
        record.last_attempt_at = Some(when);
        record.error_message = Some(message.to_string());
        record.locked_by = None;
        record.locked_until = None;
        Ok(record.attempts)
    }

    async fn mark_dead_lettered(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError> {
        self.outbox_guard()?;
        let mut tables = self.tables.lock().await;
        let record = tables.outbox_entry(id)?;
        record.status = OutboxStatus::DeadLettered;
        record.last_attempt_at = Some(when);
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        self.outbox_guard()?;
        let tables = self.tables.lock().await;
        Ok(tables.outbox.iter().find(|r| r.id == id).cloned())
    }
}
