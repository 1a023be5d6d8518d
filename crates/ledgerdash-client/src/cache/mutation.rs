//! Mutation engine: optimistic writes, commit/rollback, and reconciliation
//! of fetch results with writes that happened while the fetch was in flight.
//!
//! Every local write stamps its id with a monotonically increasing version.
//! A fetch remembers the version current when it started; when it lands,
//! ids written after that point keep their local state instead of being
//! overwritten by the (older) server snapshot. Ids with a write still
//! awaiting the server are pinned the same way until it settles.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

use super::entry::CacheEntry;
use super::lock;
use super::source::{Entity, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Upsert,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct WriteMark {
    version: u64,
    kind: WriteKind,
}

/// Kind of optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
}

/// Snapshot taken when an optimistic write starts.
#[derive(Debug, Clone)]
pub struct MutationRecord<E: Entity> {
    pub kind: MutationKind,
    pub entity_id: E::Id,
    /// `None` for creates: there was nothing before the provisional entity.
    pub previous_value: Option<E>,
    pub optimistic_value: E,
    pub version: u64,
}

/// Identifies one fetch for reconciliation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchTicket {
    seq: u64,
    version: u64,
}

/// How a landed page combines with the cached list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    Replace,
    Append,
}

/// Entry plus the bookkeeping that keeps concurrent writes coherent.
#[derive(Debug)]
pub(crate) struct CacheState<E: Entity> {
    pub(crate) entry: CacheEntry<E>,
    version: u64,
    marks: HashMap<E::Id, WriteMark>,
    /// Unsettled optimistic writes per id.
    pending: HashMap<E::Id, usize>,
    fetch_seq: u64,
    applied_fetch: u64,
    in_flight: usize,
}

impl<E: Entity> Default for CacheState<E> {
    fn default() -> Self {
        Self {
            entry: CacheEntry::default(),
            version: 0,
            marks: HashMap::new(),
            pending: HashMap::new(),
            fetch_seq: 0,
            applied_fetch: 0,
            in_flight: 0,
        }
    }
}

impl<E: Entity> CacheState<E> {
    fn mark(&mut self, id: E::Id, kind: WriteKind) -> u64 {
        self.version += 1;
        self.marks.insert(
            id,
            WriteMark {
                version: self.version,
                kind,
            },
        );
        self.version
    }

    fn pin(&mut self, id: &E::Id) {
        *self.pending.entry(id.clone()).or_insert(0) += 1;
    }

    fn unpin(&mut self, id: &E::Id) {
        if let Some(count) = self.pending.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(id);
            }
        }
    }

    /// Whether the local copy of `id` wins over what `ticket` fetched.
    fn keeps_local(&self, id: &E::Id, ticket: FetchTicket) -> bool {
        self.pending.contains_key(id)
            || self
                .marks
                .get(id)
                .is_some_and(|m| m.version > ticket.version && m.kind == WriteKind::Upsert)
    }

    fn is_latest(&self, id: &E::Id, version: u64) -> bool {
        self.marks.get(id).is_some_and(|m| m.version == version)
    }

    fn superseded(&self, id: &E::Id, version: u64) -> bool {
        self.marks.get(id).is_some_and(|m| m.version > version)
    }

    pub(crate) fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_seq += 1;
        self.in_flight += 1;
        self.entry.is_loading = true;
        FetchTicket {
            seq: self.fetch_seq,
            version: self.version,
        }
    }

    pub(crate) fn end_fetch(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.entry.is_loading = self.in_flight > 0;
    }

    /// Apply a landed page. Returns `false` when a newer fetch already
    /// landed and this result was discarded.
    pub(crate) fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        page: Page<E>,
        now: DateTime<Utc>,
        mode: FetchMode,
    ) -> bool {
        if ticket.seq < self.applied_fetch {
            debug!(
                seq = ticket.seq,
                applied = self.applied_fetch,
                "discarding stale fetch result"
            );
            return false;
        }
        self.applied_fetch = ticket.seq;

        let fetched_count = page.items.len();
        let mut fetched = HashSet::with_capacity(fetched_count);
        let mut items = Vec::with_capacity(fetched_count);

        for entity in page.items {
            let id = entity.id();
            fetched.insert(id.clone());
            let removed = self
                .marks
                .get(&id)
                .is_some_and(|m| m.version > ticket.version && m.kind == WriteKind::Removed);
            if removed {
                continue;
            }
            if self.keeps_local(&id, ticket) {
                items.push(self.entry.get(&id).cloned().unwrap_or(entity));
            } else {
                items.push(entity);
            }
        }

        match mode {
            FetchMode::Replace => {
                // Local writes the server did not return yet (provisional
                // creates) stay in front.
                let mut merged: Vec<E> = self
                    .entry
                    .list
                    .iter()
                    .filter(|e| {
                        let id = e.id();
                        !fetched.contains(&id) && self.keeps_local(&id, ticket)
                    })
                    .cloned()
                    .collect();
                merged.extend(items);
                self.entry.replace_list(merged);
                self.entry.last_fetch = Some(now);
            }
            FetchMode::Append => self.entry.append(items),
        }

        match page.pagination {
            Some(pagination) => self.entry.pagination = pagination,
            None if mode == FetchMode::Replace => {
                self.entry.pagination.total = fetched_count as u64;
                self.entry.pagination.has_more = false;
            }
            None => self.entry.pagination.has_more = false,
        }

        self.entry.error = None;
        let pending = &self.pending;
        self.marks
            .retain(|id, m| m.version > ticket.version || pending.contains_key(id));
        true
    }

    /// Prepend the provisional entity. Its id must not already be cached.
    pub(crate) fn begin_create(&mut self, provisional: E) -> ApiResult<MutationRecord<E>> {
        let id = provisional.id();
        if self.entry.contains(&id) {
            return Err(ApiError::InvalidRequest {
                message: format!("provisional id {} is already cached", id),
            });
        }

        let version = self.mark(id.clone(), WriteKind::Upsert);
        self.pin(&id);
        self.entry.prepend(provisional.clone());
        Ok(MutationRecord {
            kind: MutationKind::Create,
            entity_id: id,
            previous_value: None,
            optimistic_value: provisional,
            version,
        })
    }

    /// Apply `patch` to the cached entity. `Ok(None)` when `id` is not
    /// cached: there is nothing to update optimistically.
    pub(crate) fn begin_update(
        &mut self,
        id: &E::Id,
        patch: &Map<String, Value>,
    ) -> ApiResult<Option<MutationRecord<E>>> {
        let Some(current) = self.entry.get(id).cloned() else {
            return Ok(None);
        };

        let optimistic = apply_patch(&current, patch)?;
        if &optimistic.id() != id {
            return Err(ApiError::InvalidRequest {
                message: format!("patch for {} must not change its id", id),
            });
        }

        let version = self.mark(id.clone(), WriteKind::Upsert);
        self.pin(id);
        self.entry.swap(id, optimistic.clone());
        Ok(Some(MutationRecord {
            kind: MutationKind::Update,
            entity_id: id.clone(),
            previous_value: Some(current),
            optimistic_value: optimistic,
            version,
        }))
    }

    /// Replace the optimistic value with the server's.
    pub(crate) fn commit(&mut self, record: &MutationRecord<E>, authoritative: E) {
        self.unpin(&record.entity_id);
        match record.kind {
            MutationKind::Create => {
                let new_id = authoritative.id();
                if !self.entry.swap(&record.entity_id, authoritative) {
                    debug!(id = %record.entity_id, "provisional entity gone, nothing to confirm");
                    return;
                }
                self.marks.remove(&record.entity_id);
                // Fetches issued before the server stored the entity do not
                // contain it.
                self.mark(new_id, WriteKind::Upsert);
            }
            MutationKind::Update => {
                if self.superseded(&record.entity_id, record.version) {
                    debug!(id = %record.entity_id, "newer write pending, keeping local value");
                    return;
                }
                self.entry.swap(&record.entity_id, authoritative);
            }
        }
    }

    /// Undo an optimistic write.
    pub(crate) fn rollback(&mut self, record: &MutationRecord<E>) {
        self.unpin(&record.entity_id);
        match record.kind {
            MutationKind::Create => {
                self.entry.remove(&record.entity_id);
                if self.is_latest(&record.entity_id, record.version) {
                    self.marks.remove(&record.entity_id);
                }
            }
            MutationKind::Update => {
                if !self.is_latest(&record.entity_id, record.version) {
                    debug!(
                        id = %record.entity_id,
                        "entity changed since mutation, skipping restore"
                    );
                    return;
                }
                if let Some(previous) = &record.previous_value {
                    self.entry.swap(&record.entity_id, previous.clone());
                }
            }
        }
    }

    /// Drop an entity the server confirmed as deleted.
    pub(crate) fn confirm_delete(&mut self, id: &E::Id) {
        self.mark(id.clone(), WriteKind::Removed);
        self.entry.remove(id);
    }

    /// Back to empty. In-flight fetches will be discarded when they land.
    pub(crate) fn reset(&mut self) {
        self.entry = CacheEntry::default();
        self.marks.clear();
        self.version += 1;
        self.applied_fetch = self.fetch_seq + 1;
    }
}

/// Rolls an optimistic write back if the mutation future is dropped before
/// it settles.
pub(crate) struct RollbackGuard<'a, E: Entity> {
    state: &'a Mutex<CacheState<E>>,
    record: Option<MutationRecord<E>>,
}

impl<'a, E: Entity> RollbackGuard<'a, E> {
    pub(crate) fn new(state: &'a Mutex<CacheState<E>>, record: MutationRecord<E>) -> Self {
        Self {
            state,
            record: Some(record),
        }
    }

    pub(crate) fn disarm(mut self) -> Option<MutationRecord<E>> {
        self.record.take()
    }
}

impl<E: Entity> Drop for RollbackGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            warn!(id = %record.entity_id, "mutation abandoned before settling, rolling back");
            lock(self.state).rollback(&record);
        }
    }
}

/// JSON merge patch (RFC 7386) applied to a serialized entity.
pub(crate) fn apply_patch<E: Entity>(entity: &E, patch: &Map<String, Value>) -> ApiResult<E> {
    let mut value = serde_json::to_value(entity).map_err(|e| ApiError::InvalidRequest {
        message: format!("entity is not serializable: {}", e),
    })?;
    merge_patch(&mut value, &Value::Object(patch.clone()));
    serde_json::from_value(value).map_err(|e| ApiError::InvalidRequest {
        message: format!("patch does not fit the entity: {}", e),
    })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
