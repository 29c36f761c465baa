//! Integration tests against PostgreSQL
//!
//! Run with `DATABASE_URL` set: `cargo test -- --ignored`

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use treasury_backoffice::handlers::seed::{seed_permission_catalog, seed_system_roles};
use treasury_backoffice::handlers::{
    AssignRoleCommand, AssignmentHandler, DirectorySyncService, PermissionHandler,
    ProvisionRoleCommand, RoleHandler,
};
use treasury_backoffice::outbox::{OutboxRepository, OutboxSignal, OutboxStatus, PgOutboxStore};
use treasury_backoffice::repository::{PgDirectoryRepository, PgRbacRepository};
use treasury_backoffice::domain::SUPERUSER_SCOPE;
use treasury_backoffice::{AppError, AuthContext, AuthorizationEngine};

mod common;

/// Platform operator for `tenant_id`
fn operator(tenant_id: Uuid) -> AuthContext {
    AuthContext::new(tenant_id, Uuid::new_v4()).with_scope(SUPERUSER_SCOPE)
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_seeded_role_grants_permissions() {
    let (pool, _guard) = common::setup_test_db().await;
    let repo = Arc::new(PgRbacRepository::new(pool.clone()));
    let directory = Arc::new(PgDirectoryRepository::new(pool.clone()));
    let signal = OutboxSignal::new();

    let engine = AuthorizationEngine::new(repo.clone());
    let permissions = PermissionHandler::new(repo.clone());
    let roles = RoleHandler::new(repo.clone(), engine.clone(), signal.clone());
    let assignments =
        AssignmentHandler::new(repo.clone(), directory.clone(), engine.clone(), signal);

    assert_eq!(seed_permission_catalog(&permissions).await.unwrap(), 24);
    assert_eq!(seed_permission_catalog(&permissions).await.unwrap(), 0);

    let tenant_id = Uuid::new_v4();
    let seeded = seed_system_roles(&roles, tenant_id).await.unwrap();
    let viewer = seeded.iter().find(|r| r.code == "viewer").unwrap();
    let finance_admin = seeded.iter().find(|r| r.code == "finance_admin").unwrap();

    let sync = DirectorySyncService::new(directory);
    let (admin_id, user) = (Uuid::new_v4(), Uuid::new_v4());
    sync.sync_user(tenant_id, admin_id, "admin@acme.io").await.unwrap();
    sync.sync_user(tenant_id, user, "viewer@acme.io").await.unwrap();

    // The operator bootstraps the first tenant administrator
    assignments
        .assign(
            AssignRoleCommand::new(tenant_id, admin_id, finance_admin.id),
            &operator(tenant_id),
        )
        .await
        .unwrap();

    // A tenant user without the grant cannot hand out roles
    let denied = assignments
        .assign(
            AssignRoleCommand::new(tenant_id, user, finance_admin.id),
            &AuthContext::new(tenant_id, user),
        )
        .await;
    assert!(matches!(denied, Err(AppError::Forbidden(_))));

    let admin = AuthContext::new(tenant_id, admin_id);
    assignments
        .assign(AssignRoleCommand::new(tenant_id, user, viewer.id), &admin)
        .await
        .unwrap();

    let identity = AuthContext::new(tenant_id, user);
    assert!(engine.check_permission(&identity, "treasury.ledger.view").await.unwrap());
    assert!(!engine.check_permission(&identity, "treasury.ledger.post").await.unwrap());
    assert!(engine.check_role(&identity, "viewer").await.unwrap());

    // Same user in another tenant holds nothing
    let elsewhere = AuthContext::new(Uuid::new_v4(), user);
    assert!(!engine.check_permission(&elsewhere, "treasury.ledger.view").await.unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_duplicate_role_code_conflicts_and_appends_nothing() {
    let (pool, _guard) = common::setup_test_db().await;
    let repo = Arc::new(PgRbacRepository::new(pool.clone()));
    let roles = RoleHandler::new(repo.clone(), AuthorizationEngine::new(repo), OutboxSignal::new());
    let outbox = PgOutboxStore::new(pool);

    let tenant_id = Uuid::new_v4();
    let admin = operator(tenant_id);
    roles
        .provision(ProvisionRoleCommand::new(tenant_id, "auditor", "Auditor"), &admin)
        .await
        .unwrap();

    let err = roles
        .provision(ProvisionRoleCommand::new(tenant_id, "auditor", "Auditor"), &admin)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "got {:?}", err);

    assert_eq!(outbox.list_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_outbox_claim_lease_and_transitions() {
    let (pool, _guard) = common::setup_test_db().await;
    let repo = Arc::new(PgRbacRepository::new(pool.clone()));
    let roles = RoleHandler::new(repo.clone(), AuthorizationEngine::new(repo), OutboxSignal::new());
    let outbox = PgOutboxStore::new(pool);

    let tenant_id = Uuid::new_v4();
    let admin = operator(tenant_id);
    for code in ["first", "second"] {
        roles
            .provision(ProvisionRoleCommand::new(tenant_id, code, code), &admin)
            .await
            .unwrap();
    }

    let claimed = outbox.claim_batch("relay-a", 10, Duration::seconds(30)).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed[0].sequence < claimed[1].sequence);

    // Leased records are invisible to another relay
    let other = outbox.claim_batch("relay-b", 10, Duration::seconds(30)).await.unwrap();
    assert!(other.is_empty());

    let now = Utc::now();
    outbox.mark_published(claimed[0].id, now).await.unwrap();
    let attempts = outbox.mark_failed(claimed[1].id, "broker down", now).await.unwrap();
    assert_eq!(attempts, 1);

    let published = outbox.get(claimed[0].id).await.unwrap().unwrap();
    assert_eq!(published.status, OutboxStatus::Published);
    assert!(published.published_at.is_some());

    let failed = outbox.get(claimed[1].id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("broker down"));

    // A failed record is deliverable again once its lease is dropped
    let retried = outbox.claim_batch("relay-b", 10, Duration::seconds(30)).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].id, claimed[1].id);

    // Published is terminal
    assert!(outbox.mark_failed(claimed[0].id, "late", now).await.is_err());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_claim_skips_record_behind_row_locked_sibling() {
    let (pool, _guard) = common::setup_test_db().await;
    let repo = Arc::new(PgRbacRepository::new(pool.clone()));
    let roles = RoleHandler::new(repo.clone(), AuthorizationEngine::new(repo), OutboxSignal::new());
    let outbox = PgOutboxStore::new(pool.clone());

    let tenant_id = Uuid::new_v4();
    let admin = operator(tenant_id);
    let role = roles
        .provision(ProvisionRoleCommand::new(tenant_id, "temp", "Temp"), &admin)
        .await
        .unwrap()
        .role;
    roles.delete(tenant_id, role.id, &admin).await.unwrap();

    let pending = outbox.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].event_type, "role.provisioned");

    // A concurrent claim holds the older record's row lock but has not
    // committed its lease yet
    let mut concurrent = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM outbox_events WHERE id = $1 FOR UPDATE")
        .bind(pending[0].id)
        .execute(&mut *concurrent)
        .await
        .unwrap();

    let claimed = outbox.claim_batch("relay-b", 10, Duration::seconds(30)).await.unwrap();
    assert!(claimed.is_empty());

    concurrent.rollback().await.unwrap();

    let claimed = outbox.claim_batch("relay-b", 10, Duration::seconds(30)).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].id, pending[0].id);
    assert_eq!(claimed[1].event_type, "role.deleted");
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_directory_upsert_is_idempotent() {
    let (pool, _guard) = common::setup_test_db().await;
    let directory = DirectorySyncService::new(Arc::new(PgDirectoryRepository::new(pool)));

    let (tenant_id, external_id) = (Uuid::new_v4(), Uuid::new_v4());
    let now = Utc::now();

    let first = directory
        .sync_user_at(tenant_id, external_id, "ana@acme.io", now)
        .await
        .unwrap();
    let second = directory
        .sync_user_at(tenant_id, external_id, "ana.silva@acme.io", now + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.email, "ana.silva@acme.io");

    // An older event never overwrites a newer email
    let stale = directory
        .sync_user_at(tenant_id, external_id, "old@acme.io", now - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stale.email, "ana.silva@acme.io");

    assert_eq!(directory.list_users(tenant_id).await.unwrap().len(), 1);
}
