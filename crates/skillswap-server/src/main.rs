mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use skillswap_api::auth::{AppState, AppStateInner};
use skillswap_booking::BookingService;
use skillswap_booking::sweeper::run_sweep_loop;
use skillswap_gateway::{ConnectionRegistry, GroupRouter};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skillswap=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(skillswap_db::Database::open(&config.db_path)?);

    // Shared state
    let registry = ConnectionRegistry::new();
    let router = GroupRouter::new(registry.clone());
    let booking = Arc::new(BookingService::new(
        db.clone(),
        router.clone(),
        config.booking.clone(),
    ));

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: config.jwt_secret.clone(),
        registry: registry.clone(),
        router,
        booking: booking.clone(),
        signup_credits: config.signup_credits,
    });

    // Time-driven session transitions
    let sweeper = tokio::spawn(run_sweep_loop(booking));

    let app = routes::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("SkillSwap server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    sweeper.abort();
    info!("SkillSwap server stopped");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. Gateway sockets are closed here, otherwise
/// the graceful shutdown would wait on them forever.
async fn shutdown_signal(registry: ConnectionRegistry) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    registry.shutdown();
}
