//! # Sync Dispatcher
//!
//! Routes decoded messages to the domain on both ends of the link.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  COMPANION                                                              │
//! │                                                                         │
//! │  ConnectionClient ──inbound──► CompanionDispatcher ──► CompanionState   │
//! │        ▲                         │  (one task, one lock)     │          │
//! │        │                         │                           ▼          │
//! │        └──── sync_changes ───────┘                     StateObserver    │
//! │                                                          (UI refresh)   │
//! │                                                                         │
//! │  HOST                                                                   │
//! │                                                                         │
//! │  Session ──► HostDispatcher::route ──► HostCollaborator (domain layer)  │
//! │                     │                                                   │
//! │                     └──► [Reply | Broadcast | BroadcastOthers]          │
//! │                                                                         │
//! │  sync_changes          → sync_confirmed (sender)                        │
//! │                          + shopping_list_update (every paired session)  │
//! │  request_shopping_list → shopping_list (sender)                         │
//! │  request_store_list    → store_list (sender)                            │
//! │  timer_update          → timer_update (every other paired session)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Companion-side state mutation, persistence and the observer callback run
//! under one lock, so the UI never sees a half-applied push.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientHandle;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ShoppingListPayload, SyncMessage};
use pantry_core::ValidationError;
use pantry_core::{ChangeAction, ItemChange, ListCache, ShoppingItem, UpdateOutcome};
use pantry_db::CompanionStateRepository;

/// Name of the shopping list in the companion's cache tables.
pub const SHOPPING_LIST: &str = "shopping";

/// Domains whose latest payload is cached verbatim.
pub const SNAPSHOT_DOMAINS: &[&str] = &["meal_plan", "recipe", "todays_meals", "store_list", "timers"];

// =============================================================================
// Companion State
// =============================================================================

/// What changed, passed to the [`StateObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    ShoppingList,
    Snapshot(&'static str),
}

/// UI hook. Called while the state lock is held; must not block.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, change: &StateChange, state: &CompanionState);
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl StateObserver for NoopObserver {
    fn state_changed(&self, _change: &StateChange, _state: &CompanionState) {}
}

/// Everything the companion mirrors from the host.
#[derive(Debug, Default)]
pub struct CompanionState {
    shopping: ListCache<ShoppingItem>,
    snapshots: BTreeMap<&'static str, Value>,
    /// Set by `request_fresh_list`; the next `shopping_list` replaces.
    force_next_list: bool,
}

impl CompanionState {
    pub fn shopping(&self) -> &ListCache<ShoppingItem> {
        &self.shopping
    }

    pub fn snapshot(&self, domain: &str) -> Option<&Value> {
        self.snapshots.get(domain)
    }
}

// =============================================================================
// Companion Dispatcher
// =============================================================================

/// Applies host pushes and local edits to [`CompanionState`].
#[derive(Clone)]
pub struct CompanionDispatcher {
    state: Arc<Mutex<CompanionState>>,
    store: CompanionStateRepository,
    client: ClientHandle,
    observer: Arc<dyn StateObserver>,
}

impl CompanionDispatcher {
    /// Restores cached state from the database.
    pub async fn load(
        store: CompanionStateRepository,
        client: ClientHandle,
        observer: Arc<dyn StateObserver>,
    ) -> SyncResult<Self> {
        let shopping = store
            .load_list::<ShoppingItem>(SHOPPING_LIST)
            .await?
            .unwrap_or_default();

        let mut snapshots = BTreeMap::new();
        for domain in SNAPSHOT_DOMAINS {
            if let Some(payload) = store.load_snapshot(domain).await? {
                snapshots.insert(*domain, payload);
            }
        }

        info!(
            items = shopping.items().len(),
            pending = shopping.pending().len(),
            snapshots = snapshots.len(),
            "Companion state restored"
        );

        Ok(CompanionDispatcher {
            state: Arc::new(Mutex::new(CompanionState {
                shopping,
                snapshots,
                force_next_list: false,
            })),
            store,
            client,
            observer,
        })
    }

    /// Consumes inbound messages in order and flushes pending edits every
    /// time the link becomes paired.
    pub fn spawn(&self, mut inbound: mpsc::Receiver<SyncMessage>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut status = self.client.subscribe();

        tokio::spawn(async move {
            let mut was_ready = status.borrow_and_update().is_ready();
            if was_ready {
                dispatcher.flush().await;
            }
            let mut status_open = true;

            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Some(message) => dispatcher.handle(message).await,
                        None => break,
                    },
                    changed = status.changed(), if status_open => {
                        if changed.is_err() {
                            status_open = false;
                            continue;
                        }
                        let ready = status.borrow_and_update().is_ready();
                        if ready && !was_ready {
                            dispatcher.resend().await;
                        }
                        was_ready = ready;
                    }
                }
            }

            debug!("Companion dispatcher stopped");
        })
    }

    /// Applies one domain message from the host.
    pub async fn handle(&self, message: SyncMessage) {
        match message {
            SyncMessage::ShoppingList(payload) => self.apply_list(payload, true).await,
            SyncMessage::ShoppingListUpdate(payload) => self.apply_list(payload, false).await,
            SyncMessage::SyncConfirmed => {
                let mut state = self.state.lock().await;
                let cleared = state.shopping.acknowledge();
                debug!(cleared, "Sync batch confirmed");
                self.persist_list(&state).await;
                self.observer.state_changed(&StateChange::ShoppingList, &state);
            }
            SyncMessage::MealPlan { meal_plan } => self.apply_snapshot("meal_plan", meal_plan).await,
            SyncMessage::Recipe { recipe } => self.apply_snapshot("recipe", recipe).await,
            SyncMessage::TodaysMeals { data } => self.apply_snapshot("todays_meals", data).await,
            SyncMessage::StoreList { data } => self.apply_snapshot("store_list", data).await,
            SyncMessage::TimerUpdate { timers } => {
                self.apply_snapshot("timers", Value::Array(timers)).await
            }
            other => warn!(msg_type = other.type_name(), "Unexpected message from host"),
        }
    }

    async fn apply_list(&self, payload: ShoppingListPayload, full_list: bool) {
        let mut state = self.state.lock().await;
        let forced = full_list && std::mem::take(&mut state.force_next_list);
        let force_replace = payload.force_replace || forced;

        let outcome = state.shopping.update_from_server(
            payload.data,
            payload.version.as_deref(),
            force_replace,
        );
        debug!(?outcome, force_replace, "Applied shopping list push");

        if outcome == UpdateOutcome::Ignored {
            return;
        }
        self.persist_list(&state).await;
        self.observer.state_changed(&StateChange::ShoppingList, &state);
    }

    async fn apply_snapshot(&self, domain: &'static str, payload: Value) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.store.save_snapshot(domain, &payload).await {
            warn!(?e, domain, "Failed to cache snapshot");
        }
        state.snapshots.insert(domain, payload);
        self.observer.state_changed(&StateChange::Snapshot(domain), &state);
    }

    async fn persist_list(&self, state: &CompanionState) {
        if let Err(e) = self.store.save_list(SHOPPING_LIST, &state.shopping).await {
            warn!(?e, "Failed to persist shopping list");
        }
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Flips an item's purchased flag.
    pub async fn toggle_item(&self, id: &str) -> SyncResult<ShoppingItem> {
        let mut state = self.state.lock().await;
        let item = state.shopping.toggle(id)?.clone();
        self.after_local_edit(&mut state).await;
        Ok(item)
    }

    /// Adds an item created on this companion.
    pub async fn add_item(&self, name: &str, quantity: Option<String>) -> SyncResult<ShoppingItem> {
        let name = name.trim();
        if name.is_empty() {
            return Err(pantry_core::CoreError::from(ValidationError::Required {
                field: "name".into(),
            })
            .into());
        }

        let item = ShoppingItem::new_local(name, quantity);
        let mut state = self.state.lock().await;
        state.shopping.add(item.clone())?;
        self.after_local_edit(&mut state).await;
        Ok(item)
    }

    pub async fn delete_item(&self, id: &str) -> SyncResult<ShoppingItem> {
        let mut state = self.state.lock().await;
        let removed = state.shopping.delete(id)?;
        self.after_local_edit(&mut state).await;
        Ok(removed)
    }

    /// Persist, refresh the UI, then try to send.
    async fn after_local_edit(&self, state: &mut CompanionState) {
        self.persist_list(state).await;
        self.observer.state_changed(&StateChange::ShoppingList, state);
        self.flush_locked(state).await;
    }

    /// Sends all pending edits as one `sync_changes` batch if the link is ready.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;
    }

    /// After a reconnect: batches sent on the old socket will never be
    /// confirmed, so their edits go out again in one fresh batch.
    async fn resend(&self) {
        let mut state = self.state.lock().await;
        let abandoned = state.shopping.in_flight_batches();
        if abandoned > 0 {
            debug!(abandoned, "Dropping unconfirmed batches from previous link");
            state.shopping.abandon_in_flight();
        }
        self.flush_locked(&mut state).await;
    }

    async fn flush_locked(&self, state: &mut CompanionState) {
        if !state.shopping.has_pending() || !self.client.status().is_ready() {
            return;
        }
        let batch = state.shopping.begin_sync();
        debug!(changes = batch.len(), "Sending sync batch");
        if let Err(e) = self.client.send(SyncMessage::SyncChanges { data: batch }).await {
            warn!(?e, "Failed to queue sync batch");
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Asks the host for the full list and replaces the cache with it.
    pub async fn request_fresh_list(&self) -> SyncResult<()> {
        self.ensure_ready()?;
        self.state.lock().await.force_next_list = true;
        self.client.send(SyncMessage::RequestShoppingList).await
    }

    pub async fn request_store_list(&self) -> SyncResult<()> {
        self.ensure_ready()?;
        self.client.send(SyncMessage::RequestStoreList).await
    }

    /// Shares local kitchen timers with the host and other companions.
    pub async fn send_timers(&self, timers: Vec<Value>) -> SyncResult<()> {
        self.ensure_ready()?;
        self.apply_snapshot("timers", Value::Array(timers.clone())).await;
        self.client.send(SyncMessage::TimerUpdate { timers }).await
    }

    fn ensure_ready(&self) -> SyncResult<()> {
        if self.client.status().is_ready() {
            Ok(())
        } else {
            Err(SyncError::NotAuthenticated)
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn shopping_list(&self) -> Vec<ShoppingItem> {
        self.state.lock().await.shopping.items().to_vec()
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.state.lock().await.shopping.pending().keys().cloned().collect()
    }

    pub async fn snapshot(&self, domain: &str) -> Option<Value> {
        self.state.lock().await.snapshot(domain).cloned()
    }
}

// =============================================================================
// Host Side
// =============================================================================

/// The authoritative list after a change, as pushed to companions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSnapshot {
    pub items: Vec<ShoppingItem>,
    pub version: Option<String>,
}

/// The host application's domain layer, as seen by the sync server.
#[async_trait]
pub trait HostCollaborator: Send + Sync {
    /// Applies a batch of companion edits and returns the resulting list.
    async fn apply_changes(
        &self,
        device_id: &str,
        changes: Vec<ItemChange<ShoppingItem>>,
    ) -> SyncResult<ListSnapshot>;

    async fn shopping_list(&self) -> SyncResult<ListSnapshot>;

    async fn store_list(&self) -> SyncResult<Value>;

    /// Kitchen timers reported by a companion.
    async fn timers_updated(&self, _device_id: &str, _timers: &[Value]) {}
}

/// Where a routed reply goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Back to the sending session.
    Reply(SyncMessage),
    /// Every paired session, sender included.
    Broadcast(SyncMessage),
    /// Every paired session except the sender.
    BroadcastOthers(SyncMessage),
}

/// Host-side router for messages from paired sessions.
#[derive(Clone)]
pub struct HostDispatcher {
    collaborator: Arc<dyn HostCollaborator>,
}

impl HostDispatcher {
    pub fn new(collaborator: Arc<dyn HostCollaborator>) -> Self {
        HostDispatcher { collaborator }
    }

    pub async fn route(&self, device_id: &str, message: SyncMessage) -> Vec<Outbound> {
        match message {
            SyncMessage::SyncChanges { data } => {
                debug!(device_id = %device_id, changes = data.len(), "Applying sync batch");
                match self.collaborator.apply_changes(device_id, data).await {
                    Ok(list) => vec![
                        Outbound::Reply(SyncMessage::SyncConfirmed),
                        Outbound::Broadcast(SyncMessage::shopping_list_update(
                            list.items,
                            list.version,
                        )),
                    ],
                    Err(e) => {
                        warn!(device_id = %device_id, ?e, "Sync batch rejected");
                        vec![Outbound::Reply(SyncMessage::error(&e.to_string()))]
                    }
                }
            }
            SyncMessage::RequestShoppingList => match self.collaborator.shopping_list().await {
                Ok(list) => vec![Outbound::Reply(SyncMessage::shopping_list(
                    list.items,
                    list.version,
                ))],
                Err(e) => vec![Outbound::Reply(SyncMessage::error(&e.to_string()))],
            },
            SyncMessage::RequestStoreList => match self.collaborator.store_list().await {
                Ok(data) => vec![Outbound::Reply(SyncMessage::StoreList { data })],
                Err(e) => vec![Outbound::Reply(SyncMessage::error(&e.to_string()))],
            },
            SyncMessage::TimerUpdate { timers } => {
                self.collaborator.timers_updated(device_id, &timers).await;
                vec![Outbound::BroadcastOthers(SyncMessage::TimerUpdate { timers })]
            }
            other => {
                warn!(
                    device_id = %device_id,
                    msg_type = other.type_name(),
                    "Unexpected message from companion"
                );
                Vec::new()
            }
        }
    }
}

/// Shopping list kept in memory; the host daemon's default domain layer.
#[derive(Debug, Default)]
pub struct InMemoryShoppingList {
    inner: Mutex<ListSnapshot>,
    stores: Value,
}

impl InMemoryShoppingList {
    pub fn new(items: Vec<ShoppingItem>, stores: Value) -> Self {
        InMemoryShoppingList {
            inner: Mutex::new(ListSnapshot {
                items,
                version: Some("1".to_string()),
            }),
            stores,
        }
    }

    fn bump(list: &mut ListSnapshot) {
        let next = list
            .version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        list.version = Some(next.to_string());
    }
}

#[async_trait]
impl HostCollaborator for InMemoryShoppingList {
    async fn apply_changes(
        &self,
        device_id: &str,
        changes: Vec<ItemChange<ShoppingItem>>,
    ) -> SyncResult<ListSnapshot> {
        let mut list = self.inner.lock().await;
        let mut applied = 0;

        for change in changes {
            let position = list.items.iter().position(|i| i.id == change.id);
            match (change.action, change.item, position) {
                (ChangeAction::Delete, _, Some(index)) => {
                    list.items.remove(index);
                    applied += 1;
                }
                (ChangeAction::Add | ChangeAction::Update, Some(mut item), position) => {
                    item.locally_added = false;
                    match position {
                        Some(index) => list.items[index] = item,
                        None => list.items.push(item),
                    }
                    applied += 1;
                }
                (action, _, _) => {
                    debug!(device_id = %device_id, id = %change.id, ?action, "Skipping no-op change");
                }
            }
        }

        if applied > 0 {
            Self::bump(&mut list);
            info!(device_id = %device_id, applied, version = ?list.version, "Shopping list updated");
        }
        Ok(list.clone())
    }

    async fn shopping_list(&self) -> SyncResult<ListSnapshot> {
        Ok(self.inner.lock().await.clone())
    }

    async fn store_list(&self) -> SyncResult<Value> {
        Ok(self.stores.clone())
    }
}
