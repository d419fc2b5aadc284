use std::sync::Arc;

use anyhow::Context;
use chatrelay::{
    AppState, Config, Relay, db,
    store::{MemoryStore, SqliteStore, Store},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatrelay=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn Store> = if config.uses_memory_store() {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let db_pool = db::connect(&config.database_url, config.db_max_connections)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        Arc::new(SqliteStore::new(db_pool))
    };

    let relay = Arc::new(Relay::new(store, config.session_policy).with_outbound_capacity(config.outbound_capacity));
    let app = chatrelay::router(AppState { relay: relay.clone() }, &config.cors_origin)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, policy = ?config.session_policy, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "cannot listen for ctrl-c, serving until killed");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    relay.shutdown().await;
    info!("relay stopped");
    Ok(())
}
