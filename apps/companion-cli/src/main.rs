//! # Pantry Companion (terminal)
//!
//! Runs a companion against a host on the LAN and exposes the shopping
//! list through a small command prompt.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  stdin ──► command ──► CompanionDispatcher ──► host (when ready)        │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                      PrintingObserver ──► stdout                        │
//! │                                                                         │
//! │  status watcher ──► "enter pairing code" on PairingRequired             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//! - `123456`           submit a pairing code
//! - `list`             show the cached list with pending markers
//! - `add <name> [qty]` add an item
//! - `toggle <id>`      flip purchased
//! - `delete <id>`      remove an item
//! - `refresh`          ask the host for a full list
//! - `quit`

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pantry_core::{ConnectionStatus, PairingState, ShoppingItem};
use pantry_db::{Database, DbConfig};
use pantry_sync::dispatcher::CompanionState;
use pantry_sync::{
    ClientHandle, Companion, CompanionDispatcher, StateChange, StateObserver, SyncConfig,
};

// =============================================================================
// Observer
// =============================================================================

/// Prints the list whenever it changes.
struct PrintingObserver;

impl StateObserver for PrintingObserver {
    fn state_changed(&self, change: &StateChange, state: &CompanionState) {
        match change {
            StateChange::ShoppingList => {
                let pending: Vec<&str> = state.shopping().pending().keys().map(String::as_str).collect();
                print_list(state.shopping().items(), &pending);
            }
            StateChange::Snapshot(domain) => {
                println!("[{} updated]", domain);
            }
        }
    }
}

fn print_list(items: &[ShoppingItem], pending: &[&str]) {
    if items.is_empty() {
        println!("(shopping list is empty)");
        return;
    }
    for item in items {
        let mark = if item.purchased { "x" } else { " " };
        let sync = if pending.contains(&item.id.as_str()) { " *" } else { "" };
        match &item.quantity {
            Some(quantity) => println!("[{}] {} {} ({}){}", mark, item.id, item.name, quantity, sync),
            None => println!("[{}] {} {}{}", mark, item.id, item.name, sync),
        }
    }
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,pantry=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SyncConfig::load_or_default(None);
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(DbConfig::new(&db_path)).await?;

    let companion = Companion::with_observer(config, Arc::new(PrintingObserver))
        .start(&db)
        .await?;
    info!(device_id = %companion.device_id(), "Companion started");
    if companion.previously_paired().await? {
        println!("Paired with this host before. Waiting for it to confirm.");
    } else {
        println!("Not paired yet. Enter the 6-digit code shown on the host when asked.");
    }

    let watcher = tokio::spawn(watch_status(companion.client().clone()));

    tokio::select! {
        result = prompt(companion.client(), companion.dispatcher()) => {
            if let Err(e) = result {
                error!(?e, "Prompt failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(?e, "Failed to listen for Ctrl+C");
            }
        }
    }

    watcher.abort();
    companion.shutdown().await?;
    db.close().await;
    Ok(())
}

/// Announces status changes and asks for the code when the host wants one.
async fn watch_status(client: ClientHandle) {
    let mut status = client.subscribe();
    let mut last = status.borrow_and_update().clone();

    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();

        if current.connection != last.connection {
            match &current.connection {
                ConnectionStatus::Error { reason } => println!("Connection failed: {}", reason),
                other => println!("Link: {}", other),
            }
        }
        if current.pairing != last.pairing && current.pairing == PairingState::PairingRequired {
            println!("Enter the 6-digit pairing code shown on the host:");
        }
        if current.pairing == PairingState::Paired && last.pairing != PairingState::Paired {
            println!("Paired with host");
        }
        if let Some(message) = &current.pairing_error {
            if last.pairing_error.as_ref() != Some(message) {
                println!("{}", message);
            }
        }

        last = current;
    }
}

async fn prompt(client: &ClientHandle, dispatcher: &CompanionDispatcher) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let outcome = match command {
            "" => Ok(()),
            "quit" | "exit" => return Ok(()),
            "list" => {
                let pending = dispatcher.pending_ids().await;
                let pending: Vec<&str> = pending.iter().map(String::as_str).collect();
                print_list(&dispatcher.shopping_list().await, &pending);
                Ok(())
            }
            "add" => {
                let (name, quantity) = match rest.rsplit_once(' ') {
                    Some((name, qty)) if qty.chars().any(|c| c.is_ascii_digit()) => {
                        (name, Some(qty.to_string()))
                    }
                    _ => (rest, None),
                };
                dispatcher.add_item(name, quantity).await.map(|_| ())
            }
            "toggle" => dispatcher.toggle_item(rest).await.map(|_| ()),
            "delete" => dispatcher.delete_item(rest).await.map(|_| ()),
            "refresh" => dispatcher.request_fresh_list().await,
            code if code.len() == 6 && code.chars().all(|c| c.is_ascii_digit()) => {
                client.submit_pairing_code(code).await
            }
            other => {
                println!("Unknown command: {}", other);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_pairing_error() => {
                println!("Not paired yet. Enter the 6-digit code shown on the host.");
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    Ok(())
}
