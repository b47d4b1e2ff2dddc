//! # Pantry Host Daemon
//!
//! Runs the desktop end of the device link: the WebSocket host, the LAN
//! advertiser, and an in-memory shopping list as the domain layer.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Logging      tracing-subscriber, RUST_LOG or "info"                 │
//! │  2. Config       SyncConfig::load_or_default (sync.toml + PANTRY_*)     │
//! │  3. Database     SQLite trust store, migrations on connect              │
//! │  4. HostServer   ws://0.0.0.0:8080/ and /health                         │
//! │  5. Advertiser   UDP announce on the discovery port                     │
//! │  6. Wait         Ctrl+C / SIGTERM → withdraw, shut down                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pantry_db::{Database, DbConfig};
use pantry_sync::{
    Advertiser, HostHandle, HostOptions, HostServer, InMemoryShoppingList, SyncConfig,
};

/// How often the daemon checks whether the pairing code rotated.
const CODE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = SyncConfig::load_or_default(None);
    config.validate()?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(DbConfig::new(&db_path)).await?;
    info!(path = ?db_path, "Trust store opened");

    let trusted = db.trust_store().list_trusted().await?;
    info!(count = trusted.len(), "Trusted devices loaded");
    for device in &trusted {
        info!(
            device_id = %device.device_id,
            device_name = %device.device_name,
            device_type = %device.device_type,
            "Trusted device"
        );
    }

    let list = Arc::new(InMemoryShoppingList::new(Vec::new(), json!([])));
    let host = HostServer::new(HostOptions::from_config(&config), db.trust_store(), list)
        .start()
        .await?;

    let advertiser = if config.host.advertise {
        let host_id = config
            .device
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match Advertiser::start(config.discovery.udp_port, host_id, config.device.name.clone()).await {
            Ok(advertiser) => {
                advertiser
                    .advertise(&config.discovery.service_type, host.local_addr().port())
                    .await;
                Some(advertiser)
            }
            Err(e) => {
                warn!(?e, "Discovery unavailable; companions need an explicit address");
                None
            }
        }
    } else {
        None
    };

    let code = host.pairing_code().await;
    println!("Pantry host listening on {}", host.local_addr());
    println!("Pairing code: {}", code);

    let watcher = tokio::spawn(watch_pairing_code(host.clone(), code));

    shutdown_signal().await;
    info!("Shutting down");

    watcher.abort();
    if let Some(advertiser) = advertiser {
        advertiser.withdraw().await;
        let _ = advertiser.shutdown().await;
    }
    host.shutdown().await?;
    db.close().await;

    info!("Host daemon stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pantry=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Prints the code again whenever it expires and rotates.
async fn watch_pairing_code(host: HostHandle, mut shown: String) {
    let mut ticker = tokio::time::interval(CODE_CHECK_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let code = host.pairing_code().await;
        if code != shown {
            println!("Pairing code: {}", code);
            shown = code;
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
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
}
