use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowstone_engine::ExecutorRegistry;
use flowstone_runtime::{Runtime, RuntimeConfig};
use flowstone_storage::{PostgresStore, WorkflowStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowstone=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowstone starting...");

    let config = RuntimeConfig::from_env();
    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL environment variable required");
    }

    let store = PostgresStore::connect(&config.database_url).await?;
    tracing::info!("database connection established");

    // Built-in node types only; side-effect adapters (http, email, slack)
    // are registered by the embedding application before start.
    let registry = Arc::new(ExecutorRegistry::with_builtins());

    let runtime = Runtime::new(
        Arc::new(store) as Arc<dyn WorkflowStore>,
        registry,
        config,
    );
    let report = runtime.start().await?;
    tracing::info!(?report, "recovery finished, workers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    runtime.shutdown().await;

    Ok(())
}
