//! # Companion
//!
//! Wires the companion side together: identity, connection client,
//! dispatcher and discovery.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Companion::start                                │
//! │                                                                         │
//! │  SyncConfig ─┐                                                          │
//! │              ├──► device id (config, else stored, else new UUID)        │
//! │  Database ───┤                                                          │
//! │              └──► host URL (config, else last known)                    │
//! │                                                                         │
//! │  ┌────────────────┐ inbound ┌─────────────────────┐                     │
//! │  │ConnectionClient│ ──────► │ CompanionDispatcher │ ──► StateObserver   │
//! │  └────────────────┘         └─────────────────────┘                     │
//! │          ▲                                                              │
//! │          │ offer_address (only while disconnected)                      │
//! │  ┌───────┴────────┐                                                     │
//! │  │    Resolver    │                                                     │
//! │  └────────────────┘                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::client::{ClientHandle, ClientOptions, ConnectionClient};
use crate::config::SyncConfig;
use crate::discovery::Resolver;
use crate::dispatcher::{CompanionDispatcher, NoopObserver, StateObserver};
use crate::error::SyncResult;
use crate::transport::{Connector, WsConnector};
use pantry_core::{ConnectionStatus, LinkStatus};
use pantry_db::{CompanionStateRepository, Database};

/// Builder for the companion runtime.
pub struct Companion {
    config: SyncConfig,
    observer: Arc<dyn StateObserver>,
}

/// Running companion.
pub struct CompanionHandle {
    device_id: String,
    client: ClientHandle,
    dispatcher: CompanionDispatcher,
    store: CompanionStateRepository,
    tasks: Vec<JoinHandle<()>>,
}

impl Companion {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: SyncConfig, observer: Arc<dyn StateObserver>) -> Self {
        Companion { config, observer }
    }

    /// Starts over WebSocket.
    pub async fn start(self, db: &Database) -> SyncResult<CompanionHandle> {
        self.start_with(db, WsConnector::new()).await
    }

    pub async fn start_with<C: Connector>(
        self,
        db: &Database,
        connector: C,
    ) -> SyncResult<CompanionHandle> {
        self.config.validate()?;
        let store = db.companion_state();

        let device_id = match self.config.device.id.clone() {
            Some(id) => id,
            None => {
                store
                    .device_id_or_init(|| uuid::Uuid::new_v4().to_string())
                    .await?
            }
        };

        let mut options = ClientOptions::from_config(&self.config, device_id.clone())?;
        if options.server_url.is_none() {
            options.server_url = store.server_address().await?;
        }
        let has_address = options.server_url.is_some();

        info!(
            device_id = %device_id,
            server_url = ?options.server_url,
            discovery = self.config.discovery.enabled,
            "Starting companion"
        );

        let (client, inbound) = ConnectionClient::spawn(connector, options, store.clone());
        let dispatcher =
            CompanionDispatcher::load(store.clone(), client.clone(), self.observer).await?;

        let mut tasks = vec![dispatcher.spawn(inbound)];
        if self.config.discovery.enabled {
            let resolver = Resolver::new(&self.config.discovery);
            tasks.push(tokio::spawn(discover(client.clone(), resolver)));
        }

        if has_address {
            client.connect(None).await?;
        }

        Ok(CompanionHandle {
            device_id,
            client,
            dispatcher,
            store,
            tasks,
        })
    }
}

/// Offers resolved hosts to the client whenever it sits disconnected.
async fn discover(client: ClientHandle, resolver: Resolver) {
    let mut status = client.subscribe();
    let disconnected = |s: &LinkStatus| s.connection == ConnectionStatus::Disconnected;

    loop {
        if status.wait_for(disconnected).await.is_err() {
            return;
        }

        debug!("Looking for hosts");
        let mut hosts = resolver.clone().resolve();
        loop {
            tokio::select! {
                host = hosts.next() => {
                    let Some(host) = host else { break };
                    debug!(host_id = %host.host_id, host_name = %host.host_name, "Resolved host");
                    if client.offer_address(host.ws_url()).await.is_err() {
                        return;
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !disconnected(&*status.borrow_and_update()) {
                        break;
                    }
                }
            }
        }
    }
}

impl CompanionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn dispatcher(&self) -> &CompanionDispatcher {
        &self.dispatcher
    }

    pub fn status(&self) -> LinkStatus {
        self.client.status()
    }

    /// Whether a host accepted this device before.
    ///
    /// Only a hint for the UI. The host's own trust store decides whether
    /// the next handshake comes back authenticated.
    pub async fn previously_paired(&self) -> SyncResult<bool> {
        Ok(self.store.is_trusted().await?)
    }

    /// Stops discovery, closes the link and ends the client task.
    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down companion");
        for task in &self.tasks {
            task.abort();
        }
        let _ = self.client.disconnect().await;
        self.client.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;
    use crate::transport::memory::MemoryConnector;
    use pantry_db::DbConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(server_url: Option<&str>) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.client.server_url = server_url.map(str::to_string);
        config.discovery.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_device_id_is_generated_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let (connector, mut peers) = MemoryConnector::new();
        let first = Companion::new(config(Some("10.0.0.5")))
            .start_with(&db, connector)
            .await
            .unwrap();
        let peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
        assert_eq!(peer.url, "ws://10.0.0.5:8080");
        assert_eq!(peer.headers.device_id, first.device_id());
        let device_id = first.device_id().to_string();
        first.shutdown().await.unwrap();

        let (connector, _peers) = MemoryConnector::new();
        let second = Companion::new(config(None))
            .start_with(&db, connector)
            .await
            .unwrap();
        assert_eq!(second.device_id(), device_id);
    }

    #[tokio::test]
    async fn test_falls_back_to_last_known_address() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.companion_state()
            .set_server_address("ws://192.168.1.20:9000")
            .await
            .unwrap();

        let (connector, mut peers) = MemoryConnector::new();
        let companion = Companion::new(config(None))
            .start_with(&db, connector)
            .await
            .unwrap();
        let peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
        assert_eq!(peer.url, "ws://192.168.1.20:9000");

        peer.push(&SyncMessage::Connected {
            authenticated: true,
        });
        let mut status = companion.client().subscribe();
        timeout(WAIT, status.wait_for(LinkStatus::is_ready))
            .await
            .unwrap()
            .unwrap();
        companion.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_address_stays_idle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (connector, _peers) = MemoryConnector::new();
        let companion = Companion::new(config(None))
            .start_with(&db, connector.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.dials(), 0);
        assert_eq!(companion.status().connection, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_previously_paired_survives_restart() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let (connector, mut peers) = MemoryConnector::new();
        let first = Companion::new(config(Some("10.0.0.5")))
            .start_with(&db, connector)
            .await
            .unwrap();
        assert!(!first.previously_paired().await.unwrap());

        let peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
        peer.push(&SyncMessage::Connected {
            authenticated: true,
        });
        let mut status = first.client().subscribe();
        timeout(WAIT, status.wait_for(LinkStatus::is_ready))
            .await
            .unwrap()
            .unwrap();
        assert!(first.previously_paired().await.unwrap());
        first.shutdown().await.unwrap();

        let (connector, _peers) = MemoryConnector::new();
        let second = Companion::new(config(None))
            .start_with(&db, connector)
            .await
            .unwrap();
        assert!(second.previously_paired().await.unwrap());
    }
}
