use dotenvy::dotenv;
use salon_desk::{
    api,
    config::{self, database, owner},
    core::{catalog, staff},
    errors::{Error, Result},
    state::AppState,
    tasks::{self, BackgroundTasks},
};
use std::{env, net::SocketAddr};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load config.toml, with DATABASE_URL and PORT overriding it
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut app_config = config::load_or_default(&config_path)?;
    if let Ok(url) = env::var("DATABASE_URL") {
        app_config.database.url = url;
    }
    if let Ok(port) = env::var("PORT") {
        app_config.server.port = port.parse().map_err(|e| Error::Config {
            message: format!("PORT must be a number: {e}"),
        })?;
    }
    info!(path = %config_path, "Configuration loaded");

    // 4. Initialize database
    let db = database::create_connection(&app_config.database.url)
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db).await?;
    info!("Database initialized successfully.");

    // 5. Seed the first owner and the catalog on an empty database
    staff::bootstrap_owner(&db, &owner::owner_from_env()).await?;
    let seeded = catalog::seed_catalog(&db, &app_config.services, &app_config.products).await?;
    if seeded > 0 {
        info!(seeded, "Seeded catalog from config");
    }

    // 6. Shared state and background jobs
    let port = app_config.server.port;
    let state = AppState::new(db, app_config).await?;
    let mut background = BackgroundTasks::new();
    tasks::spawn_jobs(&mut background, &state);

    // 7. Serve until Ctrl+C
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Salon desk listening");
    axum::serve(
        listener,
        api::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    background.shutdown().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
