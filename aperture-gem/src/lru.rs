// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Residency queues.
//!
//! Each list is a `BTreeMap` from a monotonically increasing insertion key to
//! the object id, so iteration order is insertion order and removal by key is
//! O(log n). The object records its own [`LruLink`]; moving it means removing
//! the old link and pushing a new one, which keeps an object on one list at
//! most.

use std::collections::BTreeMap;

use crate::object::ObjectId;

/// Which residency queue an object sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LruList {
    /// Referenced by submitted commands whose fence has not passed.
    Active,
    /// Idle but holding a device write domain that needs a flush.
    Flushing,
    /// Idle, coherent and evictable.
    Inactive,
}

impl std::fmt::Display for LruList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Flushing => "flushing",
            Self::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Position of an object on a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruLink {
    pub list: LruList,
    key: u64,
}

#[derive(Debug, Default)]
pub struct LruLists {
    active: BTreeMap<u64, ObjectId>,
    flushing: BTreeMap<u64, ObjectId>,
    inactive: BTreeMap<u64, ObjectId>,
    next_key: u64,
}

impl LruLists {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, list: LruList) -> &BTreeMap<u64, ObjectId> {
        match list {
            LruList::Active => &self.active,
            LruList::Flushing => &self.flushing,
            LruList::Inactive => &self.inactive,
        }
    }

    fn list_mut(&mut self, list: LruList) -> &mut BTreeMap<u64, ObjectId> {
        match list {
            LruList::Active => &mut self.active,
            LruList::Flushing => &mut self.flushing,
            LruList::Inactive => &mut self.inactive,
        }
    }

    /// Append `id` to the tail of `list`.
    pub fn push_tail(&mut self, list: LruList, id: ObjectId) -> LruLink {
        let key = self.next_key;
        self.next_key += 1;
        self.list_mut(list).insert(key, id);
        LruLink { list, key }
    }

    /// Remove the entry at `link`, returning the id stored there.
    ///
    /// # Panics
    ///
    /// If the link is stale.
    pub fn remove(&mut self, link: LruLink) -> ObjectId {
        match self.list_mut(link.list).remove(&link.key) {
            Some(id) => id,
            None => panic!("stale {} list link (key {})", link.list, link.key),
        }
    }

    /// Oldest entry of `list`.
    pub fn head(&self, list: LruList) -> Option<ObjectId> {
        self.list(list).values().next().copied()
    }

    /// Entries of `list`, oldest first.
    pub fn iter(&self, list: LruList) -> impl Iterator<Item = ObjectId> + '_ {
        self.list(list).values().copied()
    }

    /// Snapshot of `list`, oldest first.
    pub fn ids(&self, list: LruList) -> Vec<ObjectId> {
        self.iter(list).collect()
    }

    pub fn len(&self, list: LruList) -> usize {
        self.list(list).len()
    }

    pub fn is_empty(&self, list: LruList) -> bool {
        self.list(list).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut lists = LruLists::new();
        lists.push_tail(LruList::Active, ObjectId(3));
        lists.push_tail(LruList::Active, ObjectId(1));
        lists.push_tail(LruList::Active, ObjectId(2));
        assert_eq!(lists.head(LruList::Active), Some(ObjectId(3)));
        assert_eq!(
            lists.ids(LruList::Active),
            vec![ObjectId(3), ObjectId(1), ObjectId(2)]
        );
    }

    #[test]
    fn test_move_to_tail() {
        let mut lists = LruLists::new();
        let a = lists.push_tail(LruList::Inactive, ObjectId(1));
        lists.push_tail(LruList::Inactive, ObjectId(2));

        assert_eq!(lists.remove(a), ObjectId(1));
        lists.push_tail(LruList::Inactive, ObjectId(1));
        assert_eq!(lists.head(LruList::Inactive), Some(ObjectId(2)));
        assert_eq!(lists.len(LruList::Inactive), 2);
        assert!(lists.is_empty(LruList::Flushing));
    }

    #[test]
    #[should_panic(expected = "stale active list link")]
    fn test_double_remove_panics() {
        let mut lists = LruLists::new();
        let link = lists.push_tail(LruList::Active, ObjectId(1));
        lists.remove(link);
        lists.remove(link);
    }
}
