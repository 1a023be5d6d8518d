//! Per-domain cache entry: ordered list plus id index.
//!
//! All list/index edits go through the methods here so the two views
//! never disagree: every id in `by_id` appears in `list` exactly once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::ApiError;

use super::source::{Entity, Filters, ListQuery, Pagination};

/// Cached state for one domain.
#[derive(Debug, Clone)]
pub struct CacheEntry<E: Entity> {
    pub list: Vec<E>,
    pub by_id: HashMap<E::Id, E>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub filters: Filters,
    pub pagination: Pagination,
    pub is_loading: bool,
    pub error: Option<ApiError>,
}

impl<E: Entity> Default for CacheEntry<E> {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            by_id: HashMap::new(),
            last_fetch: None,
            filters: Filters::new(),
            pagination: Pagination::default(),
            is_loading: false,
            error: None,
        }
    }
}

impl<E: Entity> CacheEntry<E> {
    /// Query for the current page and filters.
    pub fn query(&self) -> ListQuery {
        ListQuery {
            page: self.pagination.page,
            limit: self.pagination.limit,
            filters: self.filters.clone(),
        }
    }

    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Whether `list` and `by_id` hold the same ids, each once.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.list.len());
        for entity in &self.list {
            if !seen.insert(entity.id()) {
                return false;
            }
        }
        seen.len() == self.by_id.len() && seen.iter().all(|id| self.by_id.contains_key(id))
    }

    fn position(&self, id: &E::Id) -> Option<usize> {
        self.list.iter().position(|e| &e.id() == id)
    }

    /// Replace the list; the index is rebuilt to match. Later duplicates
    /// of an id are dropped.
    pub(crate) fn replace_list(&mut self, items: Vec<E>) {
        let mut seen = HashSet::with_capacity(items.len());
        self.list = items.into_iter().filter(|e| seen.insert(e.id())).collect();
        self.by_id = self.list.iter().map(|e| (e.id(), e.clone())).collect();
    }

    /// Append entities not already present, keeping order.
    pub(crate) fn append(&mut self, items: Vec<E>) {
        for entity in items {
            let id = entity.id();
            if self.by_id.contains_key(&id) {
                continue;
            }
            self.by_id.insert(id, entity.clone());
            self.list.push(entity);
        }
    }

    /// Insert at the front, replacing an existing entity with the same id.
    pub(crate) fn prepend(&mut self, entity: E) {
        let id = entity.id();
        if let Some(pos) = self.position(&id) {
            self.list.remove(pos);
        }
        self.by_id.insert(id, entity.clone());
        self.list.insert(0, entity);
    }

    /// Put `entity` where `id` currently sits, in both views. No-op if `id`
    /// is absent. `entity` may carry a new id (provisional → authoritative);
    /// any other copy of the new id is removed.
    pub(crate) fn swap(&mut self, id: &E::Id, entity: E) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };

        let new_id = entity.id();
        if &new_id != id {
            if let Some(dup) = self.position(&new_id) {
                self.list.remove(dup);
                let pos = if dup < pos { pos - 1 } else { pos };
                self.by_id.remove(id);
                self.by_id.insert(new_id, entity.clone());
                self.list[pos] = entity;
                return true;
            }
            self.by_id.remove(id);
        }

        self.by_id.insert(new_id, entity.clone());
        self.list[pos] = entity;
        true
    }

    pub(crate) fn remove(&mut self, id: &E::Id) -> Option<E> {
        let removed = self.by_id.remove(id);
        if let Some(pos) = self.position(id) {
            self.list.remove(pos);
        }
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Item {
        pub id: String,
        pub amount: i64,
    }

    impl Entity for Item {
        type Id = String;

        fn id(&self) -> String {
            self.id.clone()
        }
    }

    pub(crate) fn item(id: &str, amount: i64) -> Item {
        Item {
            id: id.to_string(),
            amount,
        }
    }

    fn ids(entry: &CacheEntry<Item>) -> Vec<String> {
        entry.list.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_replace_list_dedupes_and_rebuilds_index() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("a", 1), item("b", 2), item("a", 3)]);

        assert_eq!(ids(&entry), vec!["a", "b"]);
        assert_eq!(entry.get(&"a".to_string()).unwrap().amount, 1);
        assert!(entry.is_consistent());

        entry.replace_list(vec![item("c", 1)]);
        assert!(!entry.contains(&"a".to_string()));
        assert!(entry.is_consistent());
    }

    #[test]
    fn test_prepend_replaces_existing() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("a", 1), item("b", 2)]);
        entry.prepend(item("b", 5));

        assert_eq!(ids(&entry), vec!["b", "a"]);
        assert_eq!(entry.get(&"b".to_string()).unwrap().amount, 5);
        assert!(entry.is_consistent());
    }

    #[test]
    fn test_swap_keeps_position_with_new_id() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("tmp-1", 0), item("a", 1)]);

        assert!(entry.swap(&"tmp-1".to_string(), item("99", 10)));
        assert_eq!(ids(&entry), vec!["99", "a"]);
        assert!(!entry.contains(&"tmp-1".to_string()));
        assert!(entry.is_consistent());
    }

    #[test]
    fn test_swap_drops_other_copy_of_new_id() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("a", 1), item("tmp-1", 0), item("99", 3)]);

        assert!(entry.swap(&"tmp-1".to_string(), item("99", 10)));
        assert_eq!(ids(&entry), vec!["a", "99"]);
        assert_eq!(entry.get(&"99".to_string()).unwrap().amount, 10);
        assert!(entry.is_consistent());
    }

    #[test]
    fn test_append_skips_known_ids() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("a", 1)]);
        entry.append(vec![item("a", 9), item("b", 2)]);

        assert_eq!(ids(&entry), vec!["a", "b"]);
        assert_eq!(entry.get(&"a".to_string()).unwrap().amount, 1);
    }

    #[test]
    fn test_remove() {
        let mut entry = CacheEntry::default();
        entry.replace_list(vec![item("a", 1), item("b", 2)]);

        assert_eq!(entry.remove(&"a".to_string()), Some(item("a", 1)));
        assert_eq!(entry.remove(&"zzz".to_string()), None);
        assert_eq!(ids(&entry), vec!["b"]);
        assert!(entry.is_consistent());
    }
}
