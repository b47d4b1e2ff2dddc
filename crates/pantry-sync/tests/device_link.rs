//! End-to-end tests: a real host server on 127.0.0.1 and real WebSocket
//! companions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pantry_core::{ConnectionStatus, DeviceType, LinkStatus, PairingState, ShoppingItem};
use pantry_db::{Database, DbConfig};
use pantry_sync::{
    ClientHandle, Companion, CompanionHandle, HostCollaborator, HostHandle, HostOptions,
    HostServer, InMemoryShoppingList, SyncConfig, SyncMessage,
};

const WAIT: Duration = Duration::from_secs(10);

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn item(id: &str, name: &str) -> ShoppingItem {
    ShoppingItem {
        id: id.into(),
        name: name.into(),
        quantity: None,
        category: None,
        purchased: false,
        locally_added: false,
    }
}

async fn start_host(collaborator: Arc<dyn HostCollaborator>, options: HostOptions) -> HostHandle {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let options = HostOptions {
        bind_address: "127.0.0.1:0".into(),
        ..options
    };
    HostServer::new(options, db.trust_store(), collaborator)
        .start()
        .await
        .unwrap()
}

async fn start_companion(host: &HostHandle, name: &str) -> (CompanionHandle, Database) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let mut config = SyncConfig::default();
    config.device.name = name.into();
    config.device.device_type = DeviceType::Tablet;
    config.client.server_url = Some(format!("ws://{}", host.local_addr()));
    config.discovery.enabled = false;
    let companion = Companion::new(config).start(&db).await.unwrap();
    (companion, db)
}

async fn wait_status(client: &ClientHandle, predicate: impl FnMut(&LinkStatus) -> bool) -> LinkStatus {
    let mut rx = client.subscribe();
    let status = timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("status change timed out")
        .unwrap()
        .clone();
    status
}

async fn pair(companion: &CompanionHandle, host: &HostHandle) {
    wait_status(companion.client(), |s| s.pairing == PairingState::PairingRequired).await;
    companion
        .client()
        .submit_pairing_code(host.pairing_code().await)
        .await
        .unwrap();
    wait_status(companion.client(), LinkStatus::is_ready).await;
}

async fn raw_client(addr: SocketAddr, device_id: &str) -> RawSocket {
    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("X-Device-ID", device_id.parse().unwrap());
    let (socket, _) = connect_async(request).await.unwrap();
    socket
}

/// Next protocol message, or `None` once the host closes.
async fn next_message(socket: &mut RawSocket) -> Option<SyncMessage> {
    loop {
        match timeout(WAIT, socket.next()).await.expect("host went quiet") {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Pairing
// =============================================================================

#[tokio::test]
async fn test_pairing_round_trip() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;
    let (companion, db) = start_companion(&host, "Kitchen tablet").await;

    wait_status(companion.client(), |s| s.pairing == PairingState::PairingRequired).await;
    assert!(!db.companion_state().is_trusted().await.unwrap());

    // Codes are never below 100000, so this one cannot match.
    companion.client().submit_pairing_code("000000").await.unwrap();
    let status = wait_status(companion.client(), |s| s.pairing_error.is_some()).await;
    assert_eq!(status.pairing, PairingState::PairingRequired);
    assert_eq!(status.pairing_error.as_deref(), Some("Invalid pairing code"));
    assert!(status.connection.is_connected());

    // Same socket, right code.
    companion
        .client()
        .submit_pairing_code(host.pairing_code().await)
        .await
        .unwrap();
    let status = wait_status(companion.client(), LinkStatus::is_ready).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert!(db.companion_state().is_trusted().await.unwrap());

    let devices = host.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, companion.device_id());
    assert_eq!(devices[0].device_name, "Kitchen tablet");
    assert_eq!(devices[0].device_type, DeviceType::Tablet);
    assert!(devices[0].trusted);
    assert!(devices[0].paired_at.is_some());

    let sessions = host.connected().await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].paired);
}

#[tokio::test]
async fn test_trusted_device_skips_pairing() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;
    let (companion, _db) = start_companion(&host, "Phone").await;
    pair(&companion, &host).await;

    companion.client().disconnect().await.unwrap();
    wait_status(companion.client(), |s| s.connection == ConnectionStatus::Disconnected).await;

    companion.client().connect(None).await.unwrap();
    let status = wait_status(companion.client(), LinkStatus::is_ready).await;
    assert!(status.pairing_error.is_none());
}

#[tokio::test]
async fn test_revocation_round_trip() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;
    let (companion, db) = start_companion(&host, "Phone").await;
    pair(&companion, &host).await;

    host.untrust(companion.device_id()).await.unwrap();
    let status = wait_status(companion.client(), |s| {
        s.connection == ConnectionStatus::Disconnected && s.pairing == PairingState::Unpaired
    })
    .await;
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!db.companion_state().is_trusted().await.unwrap());
    assert!(host.devices().await.unwrap().is_empty());

    // No automatic reconnect after revocation.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(companion.status().connection, ConnectionStatus::Disconnected);

    companion.client().connect(None).await.unwrap();
    wait_status(companion.client(), |s| s.pairing == PairingState::PairingRequired).await;

    assert!(host.untrust("never-seen").await.is_err());
}

#[tokio::test]
async fn test_pairing_window_closes_session() {
    let host = start_host(
        Arc::new(InMemoryShoppingList::default()),
        HostOptions {
            pairing_timeout: Duration::from_millis(300),
            ..HostOptions::default()
        },
    )
    .await;

    let mut socket = raw_client(host.local_addr(), "slow-device").await;
    assert_eq!(
        next_message(&mut socket).await,
        Some(SyncMessage::Connected {
            authenticated: false
        })
    );
    assert_eq!(next_message(&mut socket).await, Some(SyncMessage::PairingRequired));
    assert_eq!(next_message(&mut socket).await, Some(SyncMessage::PairingTimeout));
    assert_eq!(next_message(&mut socket).await, None);

    until(|| async { host.connected().await.is_empty() }).await;
}

#[tokio::test]
async fn test_unpaired_session_is_gated() {
    let host = start_host(
        Arc::new(InMemoryShoppingList::new(vec![item("1", "Milk")], json!([]))),
        HostOptions::default(),
    )
    .await;

    let mut socket = raw_client(host.local_addr(), "curious-device").await;
    next_message(&mut socket).await;
    next_message(&mut socket).await;

    let request = SyncMessage::RequestShoppingList.to_json().unwrap();
    socket.send(Message::Text(request.into())).await.unwrap();
    match next_message(&mut socket).await {
        Some(SyncMessage::Error(payload)) => assert!(payload.is_not_authenticated()),
        other => panic!("expected not_authenticated, got {:?}", other),
    }

    // Protocol ping is answered even before pairing.
    let ping = SyncMessage::Ping.to_json().unwrap();
    socket.send(Message::Text(ping.into())).await.unwrap();
    assert_eq!(next_message(&mut socket).await, Some(SyncMessage::Pong));

    // Published domain events skip unpaired sessions.
    let delivered = host
        .publish(&SyncMessage::TodaysMeals { data: json!([]) })
        .await
        .unwrap();
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn test_handshake_without_device_id_is_rejected() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;

    match connect_async(format!("ws://{}/", host.local_addr())).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("handshake without X-Device-ID was accepted"),
    }
}

#[tokio::test]
async fn test_newest_session_wins() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;

    let mut first = raw_client(host.local_addr(), "twin").await;
    next_message(&mut first).await;
    next_message(&mut first).await;

    let mut second = raw_client(host.local_addr(), "twin").await;
    next_message(&mut second).await;

    assert_eq!(next_message(&mut first).await, None);
    until(|| async { host.connected().await.len() == 1 }).await;
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn test_edit_reaches_host_and_other_companions() {
    let list = Arc::new(InMemoryShoppingList::new(
        vec![item("milk", "Milk"), item("eggs", "Eggs")],
        json!([{"name": "Corner shop"}]),
    ));
    let host = start_host(list.clone(), HostOptions::default()).await;

    let (tablet, _tablet_db) = start_companion(&host, "Tablet").await;
    let (phone, _phone_db) = start_companion(&host, "Phone").await;
    pair(&tablet, &host).await;
    pair(&phone, &host).await;

    tablet.dispatcher().request_fresh_list().await.unwrap();
    until(|| async { tablet.dispatcher().shopping_list().await.len() == 2 }).await;

    let toggled = tablet.dispatcher().toggle_item("milk").await.unwrap();
    assert!(toggled.purchased);

    // Host applied it, confirmed it, and pushed the update to everyone.
    until(|| async {
        let snapshot = list.shopping_list().await.unwrap();
        snapshot.items.iter().any(|i| i.id == "milk" && i.purchased)
    })
    .await;
    until(|| async { tablet.dispatcher().pending_ids().await.is_empty() }).await;
    until(|| async {
        phone
            .dispatcher()
            .shopping_list()
            .await
            .iter()
            .any(|i| i.id == "milk" && i.purchased)
    })
    .await;

    let added = phone.dispatcher().add_item("Bread", None).await.unwrap();
    until(|| async {
        tablet
            .dispatcher()
            .shopping_list()
            .await
            .iter()
            .any(|i| i.id == added.id && !i.locally_added)
    })
    .await;

    phone.dispatcher().request_store_list().await.unwrap();
    until(|| async { phone.dispatcher().snapshot("store_list").await.is_some() }).await;
    assert_eq!(
        phone.dispatcher().snapshot("store_list").await,
        Some(json!([{"name": "Corner shop"}]))
    );
}

#[tokio::test]
async fn test_publish_and_timer_fan_out() {
    let host = start_host(Arc::new(InMemoryShoppingList::default()), HostOptions::default()).await;
    let (tablet, tablet_db) = start_companion(&host, "Tablet").await;
    let (phone, _phone_db) = start_companion(&host, "Phone").await;
    pair(&tablet, &host).await;
    pair(&phone, &host).await;

    let delivered = host
        .publish(&SyncMessage::MealPlan {
            meal_plan: json!({"monday": ["pasta"]}),
        })
        .await
        .unwrap();
    assert_eq!(delivered, 2);
    until(|| async { tablet.dispatcher().snapshot("meal_plan").await.is_some() }).await;
    assert_eq!(
        tablet_db.companion_state().load_snapshot("meal_plan").await.unwrap(),
        Some(json!({"monday": ["pasta"]}))
    );

    let timers = vec![json!({"id": "oven", "remaining": 600})];
    tablet.dispatcher().send_timers(timers.clone()).await.unwrap();
    until(|| async { phone.dispatcher().snapshot("timers").await.is_some() }).await;
    assert_eq!(
        phone.dispatcher().snapshot("timers").await,
        Some(serde_json::Value::Array(timers))
    );
}
