//! Soft per-path locks held while a received log is being applied.
//!
//! The token doubles as change attribution: when the applying session
//! releases a lock, the triggered rescan reports its changes with the
//! owner's token, and that session skips logging its own writes.

use std::collections::BTreeMap;

pub type LockToken = u64;

#[derive(Debug, Default)]
pub struct SoftLocks {
    map: BTreeMap<String, LockToken>,
}

impl SoftLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for `token`. Fails when any session already holds it.
    pub fn lock(&mut self, path: &str, token: LockToken) -> bool {
        if self.map.contains_key(path) {
            return false;
        }
        self.map.insert(path.to_string(), token);
        true
    }

    pub fn unlock(&mut self, path: &str) -> Option<LockToken> {
        self.map.remove(path)
    }

    pub fn owner(&self, path: &str) -> Option<LockToken> {
        self.map.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_path_fails() {
        let mut locks = SoftLocks::new();
        assert!(locks.lock("/w/f", 1));
        assert!(!locks.lock("/w/f", 2));
        assert_eq!(locks.owner("/w/f"), Some(1));
    }

    #[test]
    fn unlock_returns_the_owner() {
        let mut locks = SoftLocks::new();
        locks.lock("/w/f", 7);
        assert_eq!(locks.unlock("/w/f"), Some(7));
        assert_eq!(locks.unlock("/w/f"), None);
        assert!(locks.is_empty());
    }
}
