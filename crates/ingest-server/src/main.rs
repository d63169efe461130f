use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ingest_server::app;
use ingest_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingest_server=info".parse()?),
        )
        .json()
        .init();

    let cfg = ingest_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/ingest.db", cfg.data_dir);
    let db = ingest_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    if !std::path::Path::new(&cfg.geoip_path).exists() {
        tracing::warn!(
            geoip_path = %cfg.geoip_path,
            "GeoIP database not found, events will be stored with null geo fields"
        );
    }

    let config = Arc::new(cfg);
    let state = Arc::new(AppState::new(db.clone(), (*config).clone()));

    {
        let db = db.clone();
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            ingest_duckdb::retention::run_retention_loop(db, config).await;
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let app = app::build_app(Arc::clone(&state));

    info!(port = config.port, "ingest server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
