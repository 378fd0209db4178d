use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use commission_engine::gateway::AsaasClient;
use commission_engine::store::PgStore;
use commission_engine::{AppState, Config, init_pool, init_router};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = init_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let gateway = AsaasClient::new(
        &config.asaas_api_url,
        &config.asaas_api_key,
        config.gateway_timeout(),
    )?;
    let state = AppState::new(Arc::new(PgStore::new(pool)), Arc::new(gateway), &config)?;
    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set, webhook signatures are not checked");
    }

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    let app = init_router(state);

    info!("Listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
