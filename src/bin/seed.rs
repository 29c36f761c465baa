//! Seed the default permission catalog and, for each tenant given on the
//! command line, the system roles.
//!
//! Usage: `seed [--apply-schema] [TENANT_ID...]`

use std::sync::Arc;

use uuid::Uuid;

use treasury_backoffice::handlers::seed::{seed_permission_catalog, seed_system_roles};
use treasury_backoffice::handlers::{PermissionHandler, RoleHandler};
use treasury_backoffice::outbox::OutboxSignal;
use treasury_backoffice::repository::PgRbacRepository;
use treasury_backoffice::telemetry::init_tracing;
use treasury_backoffice::{db, AuthorizationEngine, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mut apply_schema = false;
    let mut tenants = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--apply-schema" {
            apply_schema = true;
            continue;
        }
        let tenant_id = Uuid::parse_str(&arg)
            .map_err(|e| anyhow::anyhow!("invalid tenant id '{}': {}", arg, e))?;
        tenants.push(tenant_id);
    }

    let config = Config::from_env()?;
    let pool = db::connect(&config).await?;

    if apply_schema {
        db::apply_schema(&pool).await?;
    }
    if !db::check_schema(&pool).await? {
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    let repo = Arc::new(PgRbacRepository::new(pool.clone()));
    let permissions = PermissionHandler::new(repo.clone());
    let engine = AuthorizationEngine::new(repo.clone());
    let roles = RoleHandler::new(repo, engine, OutboxSignal::new());

    let created = seed_permission_catalog(&permissions).await?;
    tracing::info!(created, "Permission catalog ready");

    if tenants.is_empty() {
        tracing::warn!("No tenant ids given; system roles are seeded per tenant during onboarding");
    }
    for tenant_id in tenants {
        let seeded = seed_system_roles(&roles, tenant_id).await?;
        tracing::info!(tenant_id = %tenant_id, created = seeded.len(), "Tenant roles ready");
    }

    pool.close().await;
    Ok(())
}
