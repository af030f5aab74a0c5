use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    access_gate::AccessGate, intake_service::IntakeService, object_writer::WriteLimits,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting poa-vault with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let gate = AccessGate::new(cfg.admin_token.as_deref(), cfg.session_ttl);
    let limits = WriteLimits {
        chunk_size: cfg.chunk_size,
        max_object_size: cfg.max_file_size,
    };
    let service = IntakeService::new(db.clone(), limits, gate);

    // Uploads interrupted by a previous shutdown never completed, and their
    // submissions were never recorded.
    let swept = service.store().sweep_incomplete(cfg.sweep_after).await?;
    tracing::debug!("Swept {} unfinished uploads", swept);
    let orphans = service.store().sweep_orphans(cfg.sweep_after).await?;
    tracing::debug!("Swept {} orphaned objects", orphans);

    // Expired sessions are refused on sight; this only reclaims memory.
    let gate = service.gate().clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let purged = gate.purge_expired();
            if purged > 0 {
                tracing::debug!("Purged {} expired admin sessions", purged);
            }
        }
    });

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_request_size).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
