//! sitl-manager - HTTP service supervising SITL simulator instances

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sitl_manager::core::{LifecycleManager, Settings};
use sitl_manager::persistence::Database;
use sitl_manager::{api, APP_NAME, APP_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Two managers would fight over the same port range
    let guard = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !guard.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let settings = Settings::from_env()?;

    let database = if settings.persist {
        let db = Database::open(&settings.get_database_path())?;
        db.initialize()?;
        Some(Arc::new(db))
    } else {
        info!("Persistence disabled, instance records kept in memory only");
        None
    };

    let addr: SocketAddr = format!("{}:{}", settings.http_host, settings.http_port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid HTTP bind address {}:{}",
                settings.http_host, settings.http_port
            )
        })?;

    let manager = Arc::new(LifecycleManager::new(settings, database)?);

    let cancel = CancellationToken::new();
    let reconciler = tokio::spawn(Arc::clone(&manager).run_reconciler(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    let app = api::build_router(Arc::clone(&manager));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!("HTTP server error: {}", e);
    }

    cancel.cancel();
    if let Err(e) = reconciler.await {
        warn!("Reconciler task ended abnormally: {}", e);
    }

    let stopped = manager.stop_all().await;
    info!("{} shutting down ({} instances stopped)", APP_NAME, stopped);
    served.context("HTTP server failed")
}

/// Initialize the logging system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sitl_manager=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
