//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use treasury_backoffice::bus::InMemoryBus;
use treasury_backoffice::handlers::{
    AssignmentHandler, DirectorySyncService, PermissionHandler, RoleHandler,
};
use treasury_backoffice::jobs::{OutboxRelay, RelayConfig};
use treasury_backoffice::outbox::OutboxSignal;
use treasury_backoffice::repository::InMemoryStore;
use treasury_backoffice::domain::SUPERUSER_SCOPE;
use treasury_backoffice::{AuthContext, AuthorizationEngine};

/// Every service wired over the in-memory store and bus
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub bus: InMemoryBus,
    pub signal: OutboxSignal,
    pub permissions: PermissionHandler,
    pub roles: RoleHandler,
    pub assignments: AssignmentHandler,
    pub directory: DirectorySyncService,
    pub engine: AuthorizationEngine,
    pub tenant_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let signal = OutboxSignal::new();
        let engine = AuthorizationEngine::new(store.clone());

        Self {
            bus: InMemoryBus::new(),
            permissions: PermissionHandler::new(store.clone()),
            roles: RoleHandler::new(store.clone(), engine.clone(), signal.clone()),
            assignments: AssignmentHandler::new(
                store.clone(),
                store.clone(),
                engine.clone(),
                signal.clone(),
            ),
            directory: DirectorySyncService::new(store.clone()),
            engine,
            tenant_id: Uuid::new_v4(),
            signal,
            store,
        }
    }

    /// Platform operator acting on this harness's tenant
    pub fn admin(&self) -> AuthContext {
        AuthContext::new(self.tenant_id, Uuid::new_v4()).with_scope(SUPERUSER_SCOPE)
    }

    pub fn relay(&self, config: RelayConfig) -> OutboxRelay {
        OutboxRelay::new(
            self.store.clone(),
            Arc::new(self.bus.clone()),
            self.signal.clone(),
            config,
        )
    }
}

/// Serializes tests sharing the database; every setup truncates all tables
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Setup test database - apply the schema and truncate every table.
///
/// Hold the returned guard for the whole test.
pub async fn setup_test_db() -> (PgPool, tokio::sync::MutexGuard<'static, ()>) {
    let guard = DB_LOCK.lock().await;

    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    treasury_backoffice::db::apply_schema(&pool)
        .await
        .expect("Failed to apply schema");

    sqlx::query(
        "TRUNCATE TABLE outbox_events, assignments, role_permissions, roles, permissions, directory_users CASCADE",
    )
    .execute(&pool)
    .await
    .expect("Failed to clean up DB");

    (pool, guard)
}
