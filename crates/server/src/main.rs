use std::sync::Arc;

use anyhow::Error as AnyhowError;
use db::DBService;
use server::{AppState, routes};
use services::services::{
    agent::EchoAgent, broker::BrokerManager, config::Config, execution::ExecutionEngine,
    retention::spawn_retention_sweep, streaming::StreamingService,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::asset_dir;

#[derive(Debug, Error)]
pub enum AgentServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), AgentServerError> {
    // Load environment variables from `.env` if present
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string)
        .map_err(|e| AnyhowError::msg(format!("invalid tracing filter: {e}")))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    if !asset_dir().exists() {
        std::fs::create_dir_all(asset_dir())?;
    }

    let config = Arc::new(Config::from_env());
    let db = match &config.database_url {
        Some(url) => DBService::new_with_url(url).await?,
        None => DBService::new().await?,
    };

    let brokers = Arc::new(BrokerManager::new(config.broker_capacity));
    let engine = ExecutionEngine::new(
        db.clone(),
        brokers.clone(),
        Arc::new(EchoAgent),
        config.clone(),
    );
    let streaming = StreamingService::new(db.clone(), brokers.clone());
    spawn_retention_sweep(db.clone(), brokers, config.clone());

    let state = AppState::new(db, engine, streaming, config.clone());
    let app = routes::router(state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    tracing::info!("Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
