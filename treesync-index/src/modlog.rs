//! The pending-change log: an ordered map of path → state with
//! action-aware merging.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use treesync_proto::{action, FileState};

use crate::is_parent_of;

/// Ordered set of per-path change records awaiting transfer.
///
/// Merge rules when a key is inserted twice: a later `changed` never
/// demotes an earlier `created` (the peer has not seen the file yet), and
/// `newaccess` is subsumed by whatever content action is already pending.
#[derive(Debug, Default, Clone)]
pub struct ModLog {
    map: BTreeMap<String, FileState>,
}

impl ModLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge one record. Returns `true` when the key was new.
    pub fn insert(&mut self, path: &str, state: FileState) -> bool {
        match self.map.entry(path.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
            Entry::Occupied(mut slot) => {
                let prior = slot.get();
                let merged_action = match state.action {
                    action::NEWACCESS => prior.action,
                    action::CHANGED if prior.action == action::CREATED => action::CREATED,
                    other => other,
                };
                let mut merged = state;
                merged.action = merged_action;
                slot.insert(merged);
                false
            }
        }
    }

    /// Merge every record of `other` into this log (send-log undo).
    pub fn merge_from(&mut self, other: &ModLog) {
        for (key, state) in &other.map {
            self.insert(key, *state);
        }
    }

    /// Remove every key strictly below `parent`. Called after a `rmdired`
    /// record has been emitted so the collapsed subtree is not re-sent.
    pub fn erase_children(&mut self, parent: &str) {
        let doomed: Vec<String> = self
            .map
            .range(parent.to_string()..)
            .skip(1)
            .take_while(|(key, _)| is_parent_of(parent, key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.map.remove(&key);
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileState> {
        self.map.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileState> {
        self.map.remove(path)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileState)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    /// First entry strictly after `cursor`, or the first entry at all.
    /// Log senders walk the map with this so concurrent subtree erasure
    /// cannot invalidate an iterator.
    pub fn next_after(&self, cursor: Option<&str>) -> Option<(&String, &FileState)> {
        use std::ops::Bound;
        match cursor {
            None => self.map.iter().next(),
            Some(cursor) => self
                .map
                .range::<str, _>((Bound::Excluded(cursor), Bound::Unbounded))
                .next(),
        }
    }
}
