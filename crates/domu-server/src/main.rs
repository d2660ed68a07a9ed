mod cleanup;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use domu_api::{ApiConfig, AppState, AppStateInner};
use domu_auth::SessionManager;
use domu_db::Database;
use domu_gateway::{Dispatcher, GatewayState};
use domu_types::models::Role;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "domu_server=debug,domu_api=debug,domu_auth=debug,domu_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    if let Some(email) = &config.admin_email {
        promote_admin(&db, email)?;
    }

    // Shared state
    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        &config.jwt_secret,
        chrono::Duration::days(config.session_days),
    ));
    let dispatcher = Dispatcher::new();

    tokio::spawn(cleanup::run_session_prune_loop(
        sessions.clone(),
        config.prune_interval_secs,
    ));

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        sessions: sessions.clone(),
        dispatcher: dispatcher.clone(),
        config: ApiConfig {
            public_dir: config.public_dir.clone(),
            secure_cookies: config.production,
        },
    });

    let uploads = ServeDir::new(config.public_dir.join("uploads"));
    let http_app = domu_api::router(app_state)
        .nest_service("/uploads", uploads)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let ws_app = domu_gateway::router(GatewayState::new(dispatcher, sessions))
        .layer(TraceLayer::new_for_http());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let http_addr = config.http_addr()?;
    let ws_addr = config.ws_addr()?;
    info!(
        "DomuGrauds listening on {} (ws on {}, {})",
        http_addr,
        ws_addr,
        if config.production { "production" } else { "development" }
    );

    tokio::try_join!(
        serve(http_app, http_addr, shutdown_rx.clone()),
        serve(ws_app, ws_addr, shutdown_rx),
    )?;

    info!("Shutdown complete");
    Ok(())
}

async fn serve(app: Router, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await?;
    Ok(())
}

fn promote_admin(db: &Database, email: &str) -> anyhow::Result<()> {
    match db.get_account_by_email(email)? {
        Some(account) if account.role == Role::Admin => {}
        Some(account) => {
            db.set_role(account.id, Role::Admin)?;
            info!("Promoted {} to admin", account.username);
        }
        None => warn!("DOMU_ADMIN_EMAIL {} has no account yet; register it and restart", email),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
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
}
