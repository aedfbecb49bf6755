//! Merges authoritative snapshots into the client-held working set.
//!
//! The engine owns three pieces of state for one logical feed: the working
//! set itself, a tombstone set of ids that must not be resurrected from
//! stale server data, and the content hash of the last applied snapshot.
//! Optimistic local mutations are tracked as pending until the server
//! confirms or rejects them; while pending, the local value wins over any
//! snapshot.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionError};
use crate::datetime::CanonicalDate;
use crate::model::{EntityId, WorkItem};
use crate::recurrence;

/// Id-keyed items in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    items: Vec<WorkItem>,
    index: HashMap<EntityId, usize>,
}

impl WorkingSet {
    /// Builds a set from a list that may repeat ids. The last entry for an
    /// id wins; it keeps the position of the first.
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let mut set = Self::default();
        for item in items {
            set.upsert(item);
        }
        set
    }

    pub fn upsert(&mut self, item: WorkItem) {
        match self.index.get(&item.id) {
            Some(&pos) => self.items[pos] = item,
            None => {
                self.index.insert(item.id.clone(), self.items.len());
                self.items.push(item);
            }
        }
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<WorkItem> {
        let pos = self.index.remove(id)?;
        let removed = self.items.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Swaps the entry stored under `old` for `item` in place.
    pub fn replace(&mut self, old: &EntityId, item: WorkItem) {
        if old != &item.id {
            self.remove(&item.id);
        }
        match self.index.remove(old) {
            Some(pos) => {
                self.index.insert(item.id.clone(), pos);
                self.items[pos] = item;
            }
            None => self.upsert(item),
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&WorkItem> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    pub fn as_slice(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<WorkItem> {
        self.items
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn write_field(hasher: &mut blake3::Hasher, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update(&[1]);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Order-independent structural hash of the fields that matter for change
/// suppression. Items are visited in id order and every field is length
/// prefixed, so neither input order nor field boundaries can collide.
pub fn content_hash(items: &[WorkItem]) -> ContentHash {
    let mut sorted: Vec<&WorkItem> = items.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = blake3::Hasher::new();
    hasher.update(&(sorted.len() as u64).to_le_bytes());
    for item in sorted {
        let scheduled = item.scheduled_date.map(|d| d.to_string());
        let pointer = item.current_instance_date.map(|d| d.to_string());
        write_field(&mut hasher, Some(item.id.as_str()));
        hasher.update(&[u8::from(item.completed)]);
        write_field(&mut hasher, scheduled.as_deref());
        write_field(&mut hasher, item.goal_id.as_ref().map(EntityId::as_str));
        write_field(&mut hasher, item.area_id.as_ref().map(EntityId::as_str));
        write_field(&mut hasher, Some(&item.title));
        write_field(&mut hasher, pointer.as_deref());
    }
    ContentHash(*hasher.finalize().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneOrigin {
    /// Deleted here. Only a local create lifts it: a snapshot missing the
    /// id may have been fetched, or relayed, before the server saw the delete.
    LocalDelete,
    /// Observed missing from an authoritative snapshot.
    ServerAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Create,
    Update,
    Complete,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: PendingKind,
    previous: Option<WorkItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The snapshot hashed the same as the previous one; nothing was done.
    pub suppressed: bool,
    /// The working set differs from what it was before the merge.
    pub changed: bool,
    pub dropped_tombstoned: usize,
    pub removed: usize,
    pub revived: usize,
    pub decode_failures: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileEngine {
    working: WorkingSet,
    tombstones: HashMap<EntityId, TombstoneOrigin>,
    pending: HashMap<EntityId, Pending>,
    last_hash: Option<ContentHash>,
}

impl ReconcileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[WorkItem] {
        self.working.as_slice()
    }

    pub fn get(&self, id: &EntityId) -> Option<&WorkItem> {
        self.working.get(id)
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn tombstone_origin(&self, id: &EntityId) -> Option<TombstoneOrigin> {
        self.tombstones.get(id).copied()
    }

    pub fn pending_kind(&self, id: &EntityId) -> Option<PendingKind> {
        self.pending.get(id).map(|p| p.kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_hash(&self) -> Option<ContentHash> {
        self.last_hash
    }

    /// Applies an optimistic mutation. Validation happens first; a rejected
    /// action leaves every piece of state untouched.
    #[tracing::instrument(skip(self, action), fields(action = action.name(), id = %action.target()))]
    pub fn apply_local(&mut self, action: Action) -> Result<(), ActionError> {
        action.validate()?;
        match action {
            Action::Create { item } => {
                if self.tombstones.remove(&item.id).is_some() {
                    debug!("local recreate cleared tombstone");
                }
                self.stage(PendingKind::Create, item);
            }
            Action::Update { item } => self.stage(PendingKind::Update, item),
            Action::Complete { id, on } => {
                let mut item = self
                    .working
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| ActionError::UnknownItem(id.clone()))?;
                recurrence::complete(&mut item, on);
                self.stage(PendingKind::Complete, item);
            }
            Action::Delete { id } => {
                self.working.remove(&id);
                self.pending.remove(&id);
                self.tombstones.insert(id, TombstoneOrigin::LocalDelete);
            }
        }
        Ok(())
    }

    fn stage(&mut self, kind: PendingKind, item: WorkItem) {
        let previous = self.working.get(&item.id).cloned();
        self.pending
            .entry(item.id.clone())
            .and_modify(|pending| {
                if pending.kind != PendingKind::Create {
                    pending.kind = kind;
                }
            })
            .or_insert(Pending { kind, previous });
        self.working.upsert(item);
    }

    /// The server accepted the pending mutation for `id`. When it echoed the
    /// entity back, that value replaces the optimistic one.
    #[tracing::instrument(skip(self, confirmed))]
    pub fn confirm(&mut self, id: &EntityId, confirmed: Option<WorkItem>) {
        if self.pending.remove(id).is_none() {
            debug!("nothing pending to confirm");
        }
        if let Some(item) = confirmed
            && self.tombstone_origin(&item.id) != Some(TombstoneOrigin::LocalDelete)
        {
            self.working.upsert(item);
        }
    }

    /// The server created the entity staged under `temporary` and assigned it
    /// a real id.
    #[tracing::instrument(skip(self, created), fields(server_id = %created.id))]
    pub fn confirm_create(&mut self, temporary: &EntityId, created: WorkItem) {
        self.pending.remove(temporary);
        self.tombstones.remove(&created.id);
        if self.tombstones.remove(temporary).is_some() {
            // Deleted locally before the create came back.
            self.tombstones.insert(created.id.clone(), TombstoneOrigin::LocalDelete);
            return;
        }
        self.working.replace(temporary, created);
    }

    /// The server refused the pending mutation for `id`; restore what was
    /// there before it.
    #[tracing::instrument(skip(self))]
    pub fn reject(&mut self, id: &EntityId) {
        let Some(pending) = self.pending.remove(id) else {
            return;
        };
        match pending.previous {
            Some(previous) => self.working.upsert(previous),
            None => {
                self.working.remove(id);
            }
        }
        warn!(kind = ?pending.kind, "rolled back rejected mutation");
    }

    /// The server refused a delete; bring the item back.
    #[tracing::instrument(skip(self, item), fields(id = %item.id))]
    pub fn reject_delete(&mut self, item: WorkItem) {
        self.tombstones.remove(&item.id);
        self.working.upsert(item);
    }

    /// Merges an authoritative snapshot. A snapshot whose content hash matches
    /// the last applied one is a no-op.
    #[tracing::instrument(skip(self, snapshot), fields(incoming = snapshot.len()))]
    pub fn apply_snapshot(&mut self, snapshot: Vec<WorkItem>) -> MergeOutcome {
        let incoming = WorkingSet::from_items(snapshot);
        let hash = content_hash(incoming.as_slice());
        if self.last_hash == Some(hash) {
            debug!(?hash, "snapshot unchanged; skipping merge");
            return MergeOutcome {
                suppressed: true,
                ..MergeOutcome::default()
            };
        }

        let mut outcome = MergeOutcome::default();
        let snapshot_ids: HashSet<EntityId> = incoming
            .as_slice()
            .iter()
            .map(|item| item.id.clone())
            .collect();

        let mut next = WorkingSet::default();
        for item in incoming.into_vec() {
            match self.tombstones.get(&item.id) {
                Some(TombstoneOrigin::LocalDelete) => {
                    outcome.dropped_tombstoned += 1;
                    continue;
                }
                Some(TombstoneOrigin::ServerAbsent) => {
                    self.tombstones.remove(&item.id);
                    outcome.revived += 1;
                }
                None => {}
            }

            if self.pending.contains_key(&item.id) {
                let local = self.working.get(&item.id).cloned().unwrap_or(item);
                next.upsert(local);
            } else {
                next.upsert(item);
            }
        }

        for item in self.working.as_slice() {
            if snapshot_ids.contains(&item.id) {
                continue;
            }
            if self.pending.contains_key(&item.id) {
                next.upsert(item.clone());
            } else {
                self.tombstones
                    .insert(item.id.clone(), TombstoneOrigin::ServerAbsent);
                outcome.removed += 1;
            }
        }

        outcome.changed = next != self.working;
        self.working = next;
        self.last_hash = Some(hash);

        info!(
            size = self.working.len(),
            changed = outcome.changed,
            dropped = outcome.dropped_tombstoned,
            removed = outcome.removed,
            revived = outcome.revived,
            "merged snapshot"
        );
        outcome
    }

    /// Decodes a raw JSON array element by element, dropping anything that
    /// does not look like a work item, then merges it. A payload that is not
    /// an array is ignored as a whole.
    #[tracing::instrument(skip(self, raw))]
    pub fn apply_snapshot_json(&mut self, raw: &Value) -> MergeOutcome {
        let Some(entries) = raw.as_array() else {
            warn!("snapshot payload is not an array; ignoring");
            return MergeOutcome::default();
        };

        let mut failures = 0;
        let items: Vec<WorkItem> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(item) => Some(item),
                Err(err) => {
                    failures += 1;
                    warn!(error = %err, "dropping unparseable snapshot entry");
                    None
                }
            })
            .collect();

        let mut outcome = self.apply_snapshot(items);
        outcome.decode_failures = failures;
        outcome
    }

    /// Items due on `date`.
    pub fn due_on(&self, date: CanonicalDate) -> Vec<WorkItem> {
        self.working
            .as_slice()
            .iter()
            .filter(|item| recurrence::is_due_on(item, date))
            .cloned()
            .collect()
    }
}
