//! Club Audit Backend - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use club_audit_backend::{
    api::{routes, AppState},
    db, telemetry, Config, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    telemetry::init_tracing(&config.log_level);
    tracing::info!("Starting club audit backend");

    // Connect to database: one pool for the append path, one for reporting
    let db_pool = db::create_pool(&config.database_url).await?;
    let reporting_pool = db::create_reporting_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db_pool).await?;
    tracing::info!("Database migrations complete");

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config, db_pool, reporting_pool));
    let app = routes::create_router(state);

    let addr: SocketAddr = bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Shut down on ctrl-c. In-flight audit continuations are best-effort:
/// losing trailing records during shutdown is accepted.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received");
    }
}
