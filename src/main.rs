//! Treasury back-office worker
//!
//! Runs the outbox relay and the identity event consumers against
//! PostgreSQL and Redis Streams until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use treasury_backoffice::bus::{MessageBus, RedisStreamsBus};
use treasury_backoffice::handlers::DirectorySyncService;
use treasury_backoffice::jobs::{IdentityConsumer, OutboxRelay, Worker};
use treasury_backoffice::outbox::{OutboxSignal, PgOutboxStore};
use treasury_backoffice::repository::PgDirectoryRepository;
use treasury_backoffice::telemetry::{init_tracing, shutdown_signal};
use treasury_backoffice::{db, Config};

/// How long running tasks get to settle in-flight work on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;

    tracing::info!(environment = %config.environment, "Starting treasury worker");
    tracing::info!("Connecting to database...");

    let pool = db::connect(&config).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    let client = redis::Client::open(config.redis_url.as_str())?;
    let bus: Arc<dyn MessageBus> = Arc::new(RedisStreamsBus::new(client, config.consumer_name.clone()));

    // Appends from other processes are picked up on the poll interval
    let relay = OutboxRelay::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        bus.clone(),
        OutboxSignal::new(),
        config.relay_config()?,
    );
    let directory = DirectorySyncService::new(Arc::new(PgDirectoryRepository::new(pool.clone())));
    let consumers = IdentityConsumer::user_lifecycle(bus, directory);

    let worker = Worker::new(relay, consumers).start();

    shutdown_signal().await;
    worker.stop(SHUTDOWN_GRACE).await;

    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}
