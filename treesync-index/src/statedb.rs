//! The authoritative mirror of a watchpoint's on-disk metadata.
//!
//! A rescan walks one directory (recursing only into directories it has
//! never seen), compares fresh `lstat` results against the stored entries
//! and emits one change record per affected path. Keys of removed paths
//! are dropped from the map right after their removal record is emitted.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use treesync_proto::{action, FileState};

use crate::{is_parent_of, md4_file};

/// A change detected by a rescan, ready to fan out to sessions.
#[derive(Debug, Clone)]
pub struct Change {
    pub key: String,
    pub state: FileState,
}

pub struct StateDb {
    root: PathBuf,
    map: BTreeMap<String, FileState>,
}

impl StateDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateDb {
            root: root.into(),
            map: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, key: &str) -> PathBuf {
        let mut full = self.root.as_os_str().to_owned();
        full.push(key);
        PathBuf::from(full)
    }

    pub fn get(&self, key: &str) -> Option<&FileState> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileState)> {
        self.map.iter()
    }

    /// Rescan one directory after a watcher notification (or the whole
    /// tree when `dir_key` is empty, as done at startup).
    ///
    /// `expected_md4` carries the fingerprint a just-released soft lock
    /// promised; a mismatch zeroes the stored mtime so the comparison
    /// below reclassifies the file as changed.
    pub fn change_db(
        &mut self,
        dir_key: &str,
        expected_md4: Option<&[u8; 16]>,
        is_valid: &dyn Fn(&str) -> bool,
        changes: &mut Vec<Change>,
    ) {
        if let Some(md4) = expected_md4 {
            self.validate_md4(dir_key, md4);
        }
        self.test_path(dir_key, changes);
        self.walk_tree(dir_key, is_valid, changes);
    }

    /// If the stored fingerprint differs from `expected`, force a content
    /// reclassification on the next comparison.
    pub fn validate_md4(&mut self, key: &str, expected: &[u8; 16]) {
        if let Some(state) = self.map.get_mut(key) {
            if state.is_regular() && state.md4 != *expected {
                state.mtime = 0;
            }
        }
    }

    /// Compare one path against its stored entry, emit any change, then
    /// chase stored successors that the watcher may have silently lost
    /// until a surviving one is found.
    ///
    /// A removed directory drops its whole stored subtree at once; the
    /// single `rmdired` record stands for the collapsed tree.
    pub fn test_path(&mut self, key: &str, changes: &mut Vec<Change>) -> u16 {
        use std::ops::Bound;

        let result = self.renew_state(key);
        if self.map.get(key).is_none() && result == 0 {
            // Peer notified us about a path we never tracked and which
            // does not exist; nothing to do.
            return result;
        }

        if result != 0 {
            if let Some(state) = self.map.get(key) {
                changes.push(Change {
                    key: key.to_string(),
                    state: *state,
                });
            }
        }
        if result & (action::REMOVED | action::RMDIRED) != 0 {
            self.forget_subtree(key);
        }

        // Walk forward through stored successors, reaping removals.
        let mut after = key.to_string();
        loop {
            let next = self
                .map
                .range::<String, _>((Bound::Excluded(&after), Bound::Unbounded))
                .map(|(k, _)| k.clone())
                .next();
            let Some(next) = next else { break };

            let res = self.renew_state(&next);
            if res != 0 {
                if let Some(state) = self.map.get(&next) {
                    changes.push(Change {
                        key: next.clone(),
                        state: *state,
                    });
                }
            }

            if res & (action::REMOVED | action::RMDIRED) != 0 {
                self.forget_subtree(&next);
                after = next;
            } else {
                break;
            }
        }

        result
    }

    /// Refresh one entry from `lstat`, deriving the action per the state
    /// transition table. Inserts new entries; leaves removal entries in
    /// the map for the caller to emit and erase.
    fn renew_state(&mut self, key: &str) -> u16 {
        let full = self.full_path(key);
        let existed = self.map.contains_key(key);
        let mut state = self.map.get(key).copied().unwrap_or_default();

        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(_) => {
                if state.mode != 0 {
                    let act = if state.is_dir() {
                        action::RMDIRED
                    } else {
                        action::REMOVED
                    };
                    if let Some(entry) = self.map.get_mut(key) {
                        entry.action = act;
                    }
                    return act;
                }
                return 0;
            }
        };

        let mut result = 0u16;

        if meta.mode() != state.mode || meta.gid() != state.gid || meta.uid() != state.uid {
            state.gid = meta.gid();
            state.uid = meta.uid();
            state.ctime = meta.ctime();
            state.mode = meta.mode();
            result = action::NEWACCESS;
        }

        if meta.mtime() > state.mtime || meta.size() != state.size {
            if !state.is_dir() {
                state.md4 = md4_file(&full);
                result = if state.is_symlink() {
                    action::NEWLINK
                } else {
                    action::CHANGED
                };
            }
            state.mtime = meta.mtime();
            state.size = meta.size();
        }

        if !existed {
            result = if state.is_dir() {
                action::MKDIRED
            } else if state.is_symlink() {
                action::NEWLINK
            } else if state.is_regular() {
                action::CREATED
            } else {
                0
            };
        }

        if result != 0 {
            state.action = result;
            self.map.insert(key.to_string(), state);
        } else if existed {
            self.map.insert(key.to_string(), state);
        }

        result
    }

    /// Enumerate one directory's entries; recurse only into directories
    /// that just appeared (existing subdirectories have their own watch).
    fn walk_tree(&mut self, dir_key: &str, is_valid: &dyn Fn(&str) -> bool, changes: &mut Vec<Change>) {
        let dir_path = self.full_path(dir_key);
        let entries = match fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot enumerate {}: {}", dir_path.display(), e);
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable entry in {}: {}", dir_path.display(), e);
                    continue;
                }
            };
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => {
                    warn!("skipping non-UTF-8 name in {}", dir_path.display());
                    continue;
                }
            };

            let key = format!("{dir_key}/{name}");
            if !is_valid(&key) {
                continue;
            }

            let result = self.test_path(&key, changes);

            let meta = match fs::symlink_metadata(self.full_path(&key)) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                if result & action::MKDIRED == 0 {
                    // Not newly created: its own watch covers its inside,
                    // but probe the first stored key past its subtree for
                    // removals the watcher never reported.
                    let probe = format!("{key}0");
                    if let Some(successor) =
                        self.map.range(probe..).map(|(k, _)| k.clone()).next()
                    {
                        self.test_path(&successor, changes);
                    }
                    continue;
                }
                self.walk_tree(&key, is_valid, changes);
            }
        }
    }

    /// Resolve a path by inode and device, used by the lock poller.
    pub fn find_path(&self, inode: u64, device: u64) -> Option<String> {
        for key in self.map.keys() {
            if let Ok(meta) = fs::symlink_metadata(self.full_path(key)) {
                if meta.ino() == inode && meta.dev() == device {
                    return Some(key.clone());
                }
            }
        }
        None
    }

    /// Refresh an entry without emitting a change record (backups touch
    /// their source and must not re-notify sessions).
    pub(crate) fn renew_silent(&mut self, key: &str) {
        let _ = self.renew_state(key);
    }

    pub(crate) fn range_from(&self, start: &str) -> impl Iterator<Item = (&String, &FileState)> {
        self.map.range(start.to_string()..)
    }

    /// Drop a whole stored subtree without touching the filesystem.
    pub fn forget_subtree(&mut self, key: &str) {
        let doomed: Vec<String> = self
            .map
            .range(key.to_string()..)
            .take_while(|(k, _)| is_parent_of(key, k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            self.map.remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn scan_all(db: &mut StateDb) -> Vec<Change> {
        let mut changes = Vec::new();
        db.change_db("", None, &|_| true, &mut changes);
        // The watchpoint root tracks itself under the empty key; sessions
        // never see it because nothing subscribes during the boot scan.
        changes.retain(|c| !c.key.is_empty());
        changes
    }

    #[test]
    fn initial_scan_reports_creations() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let mut db = StateDb::new(dir.path());
        let changes = scan_all(&mut db);

        let mut summary: Vec<(String, u16)> = changes
            .iter()
            .map(|c| (c.key.clone(), c.state.action))
            .collect();
        summary.sort();
        assert_eq!(
            summary,
            [
                ("/a.txt".to_string(), action::CREATED),
                ("/sub".to_string(), action::MKDIRED),
                ("/sub/b.txt".to_string(), action::CREATED),
            ]
        );
    }

    #[test]
    fn second_scan_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let mut db = StateDb::new(dir.path());
        scan_all(&mut db);
        let changes = scan_all(&mut db);
        assert!(changes.is_empty(), "unexpected: {changes:?}");
    }

    #[test]
    fn content_change_recomputes_md4() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"alpha").unwrap();

        let mut db = StateDb::new(dir.path());
        scan_all(&mut db);
        let before = db.get("/a.txt").unwrap().md4;

        // Rewind mtime granularity problems by growing the file.
        let mut handle = File::options().append(true).open(&file).unwrap();
        handle.write_all(b" more").unwrap();

        let changes = scan_all(&mut db);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state.action, action::CHANGED);
        assert_ne!(db.get("/a.txt").unwrap().md4, before);
    }

    #[test]
    fn removal_is_detected_and_entry_dropped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("b.txt"), b"beta").unwrap();

        let mut db = StateDb::new(dir.path());
        scan_all(&mut db);
        fs::remove_file(dir.path().join("a.txt")).unwrap();

        let changes = scan_all(&mut db);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "/a.txt");
        assert_eq!(changes[0].state.action, action::REMOVED);
        assert!(db.get("/a.txt").is_none());
        assert!(db.get("/b.txt").is_some());
    }

    #[test]
    fn directory_removal_collapses() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("gone")).unwrap();
        fs::write(dir.path().join("gone/x"), b"x").unwrap();

        let mut db = StateDb::new(dir.path());
        scan_all(&mut db);
        fs::remove_file(dir.path().join("gone/x")).unwrap();
        fs::remove_dir(dir.path().join("gone")).unwrap();

        let changes = scan_all(&mut db);
        let actions: Vec<u16> = changes.iter().map(|c| c.state.action).collect();
        assert!(actions.contains(&action::RMDIRED));
        assert!(db.get("/gone").is_none());
        assert!(db.get("/gone/x").is_none());
    }

    #[test]
    fn validate_md4_forces_reclassification() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let mut db = StateDb::new(dir.path());
        scan_all(&mut db);

        db.validate_md4("/a.txt", &[0u8; 16]);
        assert_eq!(db.get("/a.txt").unwrap().mtime, 0);

        let changes = scan_all(&mut db);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state.action, action::CHANGED);
    }

    #[test]
    fn excluded_paths_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seen.txt"), b"s").unwrap();
        fs::write(dir.path().join("hidden.tmp"), b"h").unwrap();

        let mut db = StateDb::new(dir.path());
        let mut changes = Vec::new();
        db.change_db("", None, &|key| !key.ends_with(".tmp"), &mut changes);
        changes.retain(|c| !c.key.is_empty());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "/seen.txt");
    }

    #[test]
    fn symlink_is_tracked_as_link() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join("link")).unwrap();

        let mut db = StateDb::new(dir.path());
        let changes = scan_all(&mut db);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state.action, action::NEWLINK);
        assert!(db.get("/link").unwrap().is_symlink());
    }
}
