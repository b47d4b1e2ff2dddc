//! # List Merge Policy
//!
//! The companion's cached copy of a host-owned list plus the set of local
//! edits the host has not confirmed yet.
//!
//! ## Update Rules
//! ```text
//! update_from_server(items, version, force_replace)
//!      │
//!      ├── items empty, cache non-empty, !force ──► Ignored
//!      │
//!      ├── force_replace ───────────────────────► Replaced (pending cleared)
//!      │
//!      ├── version == last seen ────────────────► merge, version untouched
//!      │
//!      └── otherwise ───────────────────────────► store version, merge
//! ```
//!
//! ## Item Merge
//! - Host items come first, in host order
//! - A pending local edit overrides the user-owned fields of the host copy
//! - A pending delete hides the host copy
//! - Local items the host did not mention survive only when they are
//!   locally added, completed, or carry a pending edit
//! - A host copy that already equals the pending local state clears the
//!   pending marker (the host echoed our edit)

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{ChangeAction, ItemChange};

// =============================================================================
// Sync Item
// =============================================================================

/// An entry of a host-owned list that companions may edit.
pub trait SyncItem: Clone {
    fn id(&self) -> &str;

    /// Completed entries survive a host push that omits them.
    fn is_completed(&self) -> bool;

    fn set_completed(&mut self, completed: bool);

    /// Created on this companion and never seen on the host.
    fn is_local_only(&self) -> bool;

    /// Host copy with this item's user-owned fields laid over it.
    fn keep_local_edits(&self, incoming: &Self) -> Self;

    /// Whether both copies agree on every user-owned field.
    fn same_user_state(&self, other: &Self) -> bool;
}

// =============================================================================
// Pending Edits
// =============================================================================

/// Kind of unconfirmed local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Added,
    Updated,
    Deleted,
}

impl PendingKind {
    fn action(self) -> ChangeAction {
        match self {
            PendingKind::Added => ChangeAction::Add,
            PendingKind::Updated => ChangeAction::Update,
            PendingKind::Deleted => ChangeAction::Delete,
        }
    }
}

/// A pending edit and the local edit sequence number that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub kind: PendingKind,
    pub seq: u64,
}

/// Result of applying a host push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Empty push over a non-empty cache.
    Ignored,
    Replaced,
    Merged { version_changed: bool },
}

impl UpdateOutcome {
    /// Whether the visible list may have changed.
    pub fn changed(&self) -> bool {
        !matches!(self, UpdateOutcome::Ignored)
    }
}

// =============================================================================
// List Cache
// =============================================================================

/// Cached list with pending-edit tracking.
#[derive(Debug, Clone)]
pub struct ListCache<T> {
    items: Vec<T>,
    version: Option<String>,
    pending: BTreeMap<String, PendingEdit>,
    /// Unconfirmed `sync_changes` batches, oldest first: ids and the edit
    /// sequence numbers each one carried.
    in_flight: VecDeque<BTreeMap<String, u64>>,
    next_seq: u64,
}

impl<T> Default for ListCache<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            version: None,
            pending: BTreeMap::new(),
            in_flight: VecDeque::new(),
            next_seq: 0,
        }
    }
}

impl<T: SyncItem> ListCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a cache from persisted state. Nothing is in flight.
    pub fn restore(
        items: Vec<T>,
        version: Option<String>,
        pending: BTreeMap<String, PendingEdit>,
    ) -> Self {
        let next_seq = pending.values().map(|p| p.seq + 1).max().unwrap_or(0);
        Self {
            items,
            version,
            pending,
            in_flight: VecDeque::new(),
            next_seq,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn pending(&self) -> &BTreeMap<String, PendingEdit> {
        &self.pending
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    // -------------------------------------------------------------------------
    // Host pushes
    // -------------------------------------------------------------------------

    /// Applies a host push.
    pub fn update_from_server(
        &mut self,
        incoming: Vec<T>,
        version: Option<&str>,
        force_replace: bool,
    ) -> UpdateOutcome {
        if incoming.is_empty() && !self.items.is_empty() && !force_replace {
            return UpdateOutcome::Ignored;
        }

        if force_replace {
            self.items = incoming;
            if let Some(version) = version {
                self.version = Some(version.to_string());
            }
            self.pending.clear();
            self.in_flight.clear();
            return UpdateOutcome::Replaced;
        }

        let version_changed = match version {
            Some(v) if self.version.as_deref() != Some(v) => {
                self.version = Some(v.to_string());
                true
            }
            _ => false,
        };

        self.merge(incoming);
        UpdateOutcome::Merged { version_changed }
    }

    fn merge(&mut self, incoming: Vec<T>) {
        let local: HashMap<&str, &T> = self.items.iter().map(|i| (i.id(), i)).collect();
        let mentioned: HashSet<String> = incoming.iter().map(|i| i.id().to_string()).collect();
        let mut echoed = Vec::new();
        let mut merged = Vec::with_capacity(incoming.len() + self.items.len());

        for host_item in &incoming {
            let id = host_item.id();
            match self.pending.get(id).map(|p| p.kind) {
                Some(PendingKind::Deleted) => continue,
                Some(PendingKind::Added) | Some(PendingKind::Updated) => match local.get(id) {
                    Some(local_item) if local_item.same_user_state(host_item) => {
                        echoed.push(id.to_string());
                        merged.push(host_item.clone());
                    }
                    Some(local_item) => merged.push(local_item.keep_local_edits(host_item)),
                    None => merged.push(host_item.clone()),
                },
                None => merged.push(host_item.clone()),
            }
        }

        for local_item in &self.items {
            let id = local_item.id();
            if mentioned.contains(id) {
                continue;
            }
            let pending_edit = matches!(
                self.pending.get(id).map(|p| p.kind),
                Some(PendingKind::Added) | Some(PendingKind::Updated)
            );
            if local_item.is_local_only() || local_item.is_completed() || pending_edit {
                merged.push(local_item.clone());
            }
        }

        for id in echoed {
            self.pending.remove(&id);
            for batch in &mut self.in_flight {
                batch.remove(&id);
            }
        }
        self.items = merged;
    }

    // -------------------------------------------------------------------------
    // Local mutations
    // -------------------------------------------------------------------------

    fn mark(&mut self, id: &str, kind: PendingKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(id.to_string(), PendingEdit { kind, seq });
    }

    /// Flips an item's completed flag and marks it pending.
    pub fn toggle(&mut self, id: &str) -> CoreResult<&T> {
        let index = self
            .items
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;

        let completed = self.items[index].is_completed();
        self.items[index].set_completed(!completed);

        let kind = match self.pending.get(id).map(|p| p.kind) {
            Some(PendingKind::Added) => PendingKind::Added,
            _ => PendingKind::Updated,
        };
        self.mark(id, kind);
        Ok(&self.items[index])
    }

    /// Appends a locally created item and marks it pending.
    pub fn add(&mut self, item: T) -> CoreResult<()> {
        if self.get(item.id()).is_some() {
            return Err(CoreError::DuplicateItem(item.id().to_string()));
        }
        let id = item.id().to_string();
        self.items.push(item);
        self.mark(&id, PendingKind::Added);
        Ok(())
    }

    /// Removes an item and records the delete for the host.
    pub fn delete(&mut self, id: &str) -> CoreResult<T> {
        let index = self
            .items
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;
        let removed = self.items.remove(index);

        let never_sent = matches!(self.pending.get(id).map(|p| p.kind), Some(PendingKind::Added))
            && !self.in_flight.iter().any(|batch| batch.contains_key(id));
        if never_sent {
            self.pending.remove(id);
        } else {
            self.mark(id, PendingKind::Deleted);
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Outbound batches
    // -------------------------------------------------------------------------

    /// Every pending edit as a change entry.
    pub fn pending_changes(&self) -> Vec<ItemChange<T>> {
        self.pending
            .iter()
            .filter_map(|(id, edit)| {
                let item = match edit.kind {
                    PendingKind::Deleted => None,
                    _ => Some(self.get(id)?.clone()),
                };
                Some(ItemChange {
                    id: id.clone(),
                    action: edit.kind.action(),
                    item,
                })
            })
            .collect()
    }

    /// Queues the pending set as a new in-flight batch and returns it.
    pub fn begin_sync(&mut self) -> Vec<ItemChange<T>> {
        self.in_flight.push_back(
            self.pending
                .iter()
                .map(|(id, edit)| (id.clone(), edit.seq))
                .collect(),
        );
        self.pending_changes()
    }

    /// Handles `sync_confirmed`: clears the edits of the oldest unconfirmed
    /// batch.
    ///
    /// An item edited again after that batch went out keeps its marker, as
    /// does anything only carried by a later batch.
    pub fn acknowledge(&mut self) -> usize {
        let Some(batch) = self.in_flight.pop_front() else {
            return 0;
        };
        let mut cleared = 0;
        for (id, seq) in batch {
            if self.pending.get(&id).map(|p| p.seq) == Some(seq) {
                self.pending.remove(&id);
                cleared += 1;
            }
        }
        cleared
    }

    /// Number of batches sent and not yet confirmed.
    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.len()
    }

    /// Forgets unconfirmed batches after the link dropped. Their edits stay
    /// pending and go out again with the next batch.
    pub fn abandon_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShoppingItem;

    fn item(id: &str, purchased: bool) -> ShoppingItem {
        ShoppingItem {
            id: id.to_string(),
            name: format!("item {}", id),
            quantity: None,
            category: None,
            purchased,
            locally_added: false,
        }
    }

    fn ids(cache: &ListCache<ShoppingItem>) -> Vec<&str> {
        cache.items().iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut cache = ListCache::new();
        let snapshot = vec![item("a", false), item("b", true), item("c", false)];
        cache.update_from_server(snapshot.clone(), Some("v1"), false);
        cache.add(ShoppingItem::new_local("Bread", None)).unwrap();
        cache.toggle("a").unwrap();

        cache.update_from_server(snapshot.clone(), Some("v1"), false);
        let once = cache.items().to_vec();
        let pending_once = cache.pending().clone();
        cache.update_from_server(snapshot, Some("v1"), false);

        assert_eq!(cache.items(), once.as_slice());
        assert_eq!(cache.pending(), &pending_once);
    }

    #[test]
    fn test_pending_edit_wins_over_push() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], Some("v1"), false);
        cache.toggle("a").unwrap();

        let mut renamed = item("a", false);
        renamed.name = "Apples".into();
        cache.update_from_server(vec![renamed], Some("v2"), false);

        let a = cache.get("a").unwrap();
        assert!(a.purchased);
        assert_eq!(a.name, "Apples");
        assert!(cache.is_pending("a"));
        assert_eq!(cache.version(), Some("v2"));
    }

    #[test]
    fn test_pending_delete_not_resurrected() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false), item("b", false)], None, false);
        cache.delete("a").unwrap();

        cache.update_from_server(vec![item("a", false), item("b", false)], None, false);
        assert_eq!(ids(&cache), vec!["b"]);
        assert_eq!(cache.pending()["a"].kind, PendingKind::Deleted);
    }

    #[test]
    fn test_empty_push_ignored_unless_forced() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], Some("v1"), false);

        assert_eq!(
            cache.update_from_server(Vec::new(), Some("v2"), false),
            UpdateOutcome::Ignored
        );
        assert_eq!(ids(&cache), vec!["a"]);
        assert_eq!(cache.version(), Some("v1"));

        assert_eq!(
            cache.update_from_server(Vec::new(), Some("v2"), true),
            UpdateOutcome::Replaced
        );
        assert!(cache.items().is_empty());
    }

    #[test]
    fn test_empty_push_into_empty_cache_merges() {
        let mut cache: ListCache<ShoppingItem> = ListCache::new();
        let outcome = cache.update_from_server(Vec::new(), Some("v1"), false);
        assert_eq!(
            outcome,
            UpdateOutcome::Merged {
                version_changed: true
            }
        );
    }

    #[test]
    fn test_force_replace_clears_pending() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], Some("v1"), false);
        cache.toggle("a").unwrap();
        cache.add(ShoppingItem::new_local("Local", None)).unwrap();

        let outcome = cache.update_from_server(
            vec![item("x", false), item("y", false), item("z", true)],
            Some("v9"),
            true,
        );
        assert_eq!(outcome, UpdateOutcome::Replaced);
        assert_eq!(ids(&cache), vec!["x", "y", "z"]);
        assert!(!cache.has_pending());
        assert_eq!(cache.version(), Some("v9"));
    }

    #[test]
    fn test_same_version_is_delta() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false), item("b", true)], Some("v1"), false);

        let outcome = cache.update_from_server(vec![item("c", false)], Some("v1"), false);
        assert_eq!(
            outcome,
            UpdateOutcome::Merged {
                version_changed: false
            }
        );
        // "b" is completed so it survives; "a" was neither local nor completed.
        assert_eq!(ids(&cache), vec!["c", "b"]);
        assert_eq!(cache.version(), Some("v1"));
    }

    #[test]
    fn test_unmentioned_local_items_kept() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], None, false);
        let local = ShoppingItem::new_local("Flour", Some("1 kg".into()));
        let local_id = local.id.clone();
        cache.add(local).unwrap();

        cache.update_from_server(vec![item("b", false)], None, false);
        assert_eq!(ids(&cache), vec!["b", local_id.as_str()]);
    }

    #[test]
    fn test_echo_clears_pending() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], None, false);
        cache.toggle("a").unwrap();

        cache.update_from_server(vec![item("a", true)], None, false);
        assert!(!cache.is_pending("a"));
        assert!(cache.get("a").unwrap().purchased);
    }

    #[test]
    fn test_acknowledge_clears_only_in_flight() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false), item("b", false)], None, false);
        cache.toggle("a").unwrap();

        let batch = cache.begin_sync();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].action, ChangeAction::Update);

        cache.toggle("b").unwrap();
        assert_eq!(cache.acknowledge(), 1);
        assert!(!cache.is_pending("a"));
        assert!(cache.is_pending("b"));
    }

    #[test]
    fn test_edit_after_batch_survives_ack() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], None, false);
        cache.toggle("a").unwrap();
        cache.begin_sync();
        cache.toggle("a").unwrap();

        assert_eq!(cache.acknowledge(), 0);
        assert!(cache.is_pending("a"));
    }

    #[test]
    fn test_ack_confirms_only_oldest_batch() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false), item("b", false)], Some("v1"), false);

        cache.toggle("a").unwrap();
        assert_eq!(cache.begin_sync().len(), 1);
        cache.toggle("b").unwrap();
        assert_eq!(cache.begin_sync().len(), 2);
        assert_eq!(cache.in_flight_batches(), 2);

        assert_eq!(cache.acknowledge(), 1);
        assert!(!cache.is_pending("a"));
        assert!(cache.is_pending("b"));

        // Host broadcast after the first batch only: b's edit still wins.
        cache.update_from_server(vec![item("a", true), item("b", false)], Some("v2"), false);
        assert!(cache.get("b").unwrap().purchased);

        assert_eq!(cache.acknowledge(), 1);
        assert!(!cache.has_pending());
        assert_eq!(cache.acknowledge(), 0);
    }

    #[test]
    fn test_abandoned_batches_stay_pending() {
        let mut cache = ListCache::new();
        cache.update_from_server(vec![item("a", false)], None, false);
        cache.toggle("a").unwrap();
        cache.begin_sync();

        cache.abandon_in_flight();
        assert_eq!(cache.in_flight_batches(), 0);
        assert_eq!(cache.acknowledge(), 0);
        assert!(cache.is_pending("a"));

        assert_eq!(cache.begin_sync().len(), 1);
        assert_eq!(cache.acknowledge(), 1);
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_delete_of_unsent_local_item_leaves_no_trace() {
        let mut cache: ListCache<ShoppingItem> = ListCache::new();
        let local = ShoppingItem::new_local("Salt", None);
        let id = local.id.clone();
        cache.add(local).unwrap();
        cache.delete(&id).unwrap();

        assert!(cache.items().is_empty());
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_mutation_errors() {
        let mut cache: ListCache<ShoppingItem> = ListCache::new();
        assert!(matches!(cache.toggle("nope"), Err(CoreError::ItemNotFound(_))));
        cache.add(item("a", false)).unwrap();
        assert!(matches!(
            cache.add(item("a", false)),
            Err(CoreError::DuplicateItem(_))
        ));
    }

    #[test]
    fn test_restore_continues_sequence() {
        let mut pending = BTreeMap::new();
        pending.insert(
            "a".to_string(),
            PendingEdit {
                kind: PendingKind::Updated,
                seq: 4,
            },
        );
        let mut cache = ListCache::restore(vec![item("a", true)], Some("v3".into()), pending);
        cache.begin_sync();
        cache.toggle("a").unwrap();
        assert_eq!(cache.pending()["a"].seq, 5);
        assert_eq!(cache.acknowledge(), 0);
    }
}
