//! Dine Sync - dashboard backend
//!
//! Serves the tenant collections over HTTP from the local cache, backed by
//! an in-process remote store seeded with a demo tenant.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dine_sync::api::{create_router, AppState};
use dine_sync::cache::{FilePersistence, MemoryPersistence, Persistence};
use dine_sync::models::{Category, MenuItem, StaffMember, Table};
use dine_sync::remote::MemoryRemote;
use dine_sync::{Config, SyncEngine, TenantId};

/// Main entry point for the dashboard backend.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the cache persistence backend
/// 4. Build the sync engine around the remote store
/// 5. Watch for the one-time client reset signal
/// 6. Start HTTP server on configured port
/// 7. Close push channels on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dine_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Dine Sync dashboard backend");

    let config = Config::from_env();
    info!(
        "Configuration loaded: port={}, debounce={}ms, fetch_attempts={}, cache_dir={:?}",
        config.server_port, config.subscribe_debounce_ms, config.fetch_max_attempts, config.cache_dir
    );

    let persistence: Arc<dyn Persistence> = match &config.cache_dir {
        Some(dir) => Arc::new(
            FilePersistence::new(dir)
                .with_context(|| format!("failed to open cache directory {}", dir.display()))?,
        ),
        None => Arc::new(MemoryPersistence::new()),
    };

    let remote = Arc::new(MemoryRemote::new());
    seed_demo_tenant(&remote);

    let state = AppState::new(SyncEngine::new(remote, persistence, &config));
    let engine = Arc::clone(&state.engine);
    info!("Sync engine initialized");

    let mut recovery = engine.health().recovery_signal();
    tokio::spawn(async move {
        while recovery.changed().await.is_ok() {
            if *recovery.borrow() {
                warn!("Remote connection needs a full client reset; restart the process");
                break;
            }
        }
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    engine.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Seeds the `demo` tenant so the endpoints have something to serve.
fn seed_demo_tenant(remote: &MemoryRemote) {
    let tenant = TenantId::new("demo");

    remote.seed_items(
        &tenant,
        &[
            Table::new("1", "main"),
            Table::new("2", "main"),
            Table::new("10", "main"),
            Table::new("1", "terrace"),
        ],
    );
    remote.seed_items(
        &tenant,
        &[
            Category {
                id: "starters".into(),
                name: "Starters".into(),
                position: 1,
                updated_at: None,
            },
            Category {
                id: "mains".into(),
                name: "Mains".into(),
                position: 2,
                updated_at: None,
            },
        ],
    );
    remote.seed_items(
        &tenant,
        &[MenuItem {
            id: String::new(),
            name: "Tomato soup".into(),
            category_id: "starters".into(),
            price_cents: 650,
            available: true,
            updated_at: None,
        }],
    );
    remote.seed_items(
        &tenant,
        &[StaffMember {
            id: String::new(),
            name: "Sam".into(),
            role: "manager".into(),
            active: true,
            updated_at: None,
        }],
    );
    info!("Seeded demo tenant '{}'", tenant);
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
