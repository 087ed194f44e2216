//! A watched directory tree: policy, the state database, and the
//! filesystem application of remote operations.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, info, warn};
use treesync_index::snapshot;
use treesync_index::statedb::{Change, StateDb};
use treesync_proto::{action, FileState};

use crate::{EngineError, Result};

/// Directory name for transient state inside the watchpoint. Anything
/// under it is invisible to scans and peers.
pub const SCRATCH_DIR: &str = ".tsynctmp";

#[derive(Debug, Clone, Default)]
pub struct WatchPointOptions {
    pub path: PathBuf,
    pub export: String,
    pub readonly: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Root under which per-watchpoint state directories are created.
    pub state_root: PathBuf,
}

pub struct WatchPoint {
    pub db: StateDb,
    path_str: String,
    export: String,
    readonly: bool,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
    state_dir: PathBuf,
    tmp_dir: PathBuf,
}

// Process-wide so concurrent snapshots of different watchpoints (and of
// both ends of a local pair) never collide on a name.
static SNAPSHOT_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl WatchPoint {
    /// Validate the configured tree and set up the scratch and state
    /// directories, recreating the scratch directory from scratch.
    pub fn new(opts: WatchPointOptions) -> Result<Self> {
        let path_str = opts.path.to_string_lossy().trim_end_matches('/').to_string();
        let path = PathBuf::from(&path_str);

        if fs::create_dir_all(&path).is_ok() {
            debug!("watchpoint root {} present", path.display());
        }
        if !path.is_dir() {
            return Err(EngineError::NotADirectory(path_str));
        }

        let tmp_dir = path.join(SCRATCH_DIR);
        let _ = fs::remove_dir_all(&tmp_dir);
        fs::create_dir(&tmp_dir)?;
        fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o700))?;

        // One state directory per watchpoint, keyed by the flattened path.
        let flat: String = path_str
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        let state_dir = opts.state_root.join(flat);
        fs::create_dir_all(&state_dir)?;

        let includes = compile_patterns(&opts.include);
        let excludes = compile_patterns(&opts.exclude);

        Ok(WatchPoint {
            db: StateDb::new(&path),
            path_str,
            export: opts.export,
            readonly: opts.readonly,
            includes,
            excludes,
            state_dir,
            tmp_dir,
        })
    }

    pub fn path(&self) -> &str {
        &self.path_str
    }

    pub fn export_name(&self) -> &str {
        &self.export
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn full_path(&self, key: &str) -> PathBuf {
        self.db.full_path(key)
    }

    pub fn last_sync_state_path(&self) -> PathBuf {
        self.state_dir.join("last-sync-state")
    }

    /// Policy check on a full path: the scratch sentinel always loses,
    /// includes win over excludes, default is accept.
    pub fn is_valid_path(&self, full: &str) -> bool {
        if full.contains("/.tsynctmp") {
            return false;
        }
        if self.includes.iter().any(|p| p.matches(full)) {
            return true;
        }
        if self.excludes.iter().any(|p| p.matches(full)) {
            return false;
        }
        true
    }

    pub fn valid_key(&self, key: &str) -> bool {
        self.is_valid_path(&format!("{}{}", self.path_str, key))
    }

    /// Rescan a directory (or single path) and collect change records.
    pub fn rescan(&mut self, key: &str, expected_md4: Option<&[u8; 16]>) -> Vec<Change> {
        let mut changes = Vec::new();
        let path_str = &self.path_str;
        let includes = &self.includes;
        let excludes = &self.excludes;
        let valid = |key: &str| {
            let full = format!("{path_str}{key}");
            if full.contains("/.tsynctmp") {
                return false;
            }
            if includes.iter().any(|p| p.matches(&full)) {
                return true;
            }
            !excludes.iter().any(|p| p.matches(&full))
        };
        self.db.change_db(key, expected_md4, &valid, &mut changes);
        changes.retain(|c| !c.key.is_empty());
        changes
    }

    /// Serialize the database. With a sequence token the snapshot goes to
    /// the scratch directory and the returned key is relative to the
    /// watchpoint; without one it becomes the persistent last-sync state.
    pub fn create_state_file(&mut self, transient: bool) -> Result<(String, u64)> {
        let (path, key) = if transient {
            let seq = SNAPSHOT_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            let name = format!(".tsync-state-{}-{}", std::process::id(), seq);
            let path = self.tmp_dir.join(&name);
            let key = format!("/{SCRATCH_DIR}/{name}");
            (path, key)
        } else {
            (self.last_sync_state_path(), String::new())
        };

        let size = snapshot::write_to_file(&self.db, &path)?;
        Ok((key, size))
    }

    /// A path may be written by a peer when the watchpoint is writable
    /// and the file is not a root-owned file without any write bit. Also
    /// reports the current on-disk state for building inverse records.
    pub fn is_writeable(&self, key: &str) -> (bool, FileState) {
        use std::os::unix::fs::MetadataExt;

        let mut state = FileState {
            action: action::CHANGED,
            ..FileState::default()
        };
        let writable = match fs::symlink_metadata(self.full_path(key)) {
            Ok(meta) => {
                state.uid = meta.uid();
                state.gid = meta.gid();
                state.mode = meta.mode();
                state.mtime = meta.mtime();
                state.ctime = meta.ctime();
                state.size = meta.size();
                meta.uid() != 0 || meta.mode() & 0o222 != 0
            }
            Err(_) => true,
        };
        (!self.readonly && writable, state)
    }

    /// Remove whatever sits at `key`, trees included.
    pub fn remove(&self, key: &str) {
        let full = self.full_path(key);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => {
                if let Err(e) = fs::remove_dir_all(&full) {
                    debug!("remove {} failed: {}", full.display(), e);
                }
            }
            Ok(_) => {
                if let Err(e) = fs::remove_file(&full) {
                    debug!("remove {} failed: {}", full.display(), e);
                }
            }
            Err(_) => {}
        }
    }

    /// Create a directory carrying the peer's mode and ownership.
    pub fn mkdir(&self, key: &str, state: &FileState) {
        let full = self.full_path(key);
        if let Err(e) = fs::create_dir(&full) {
            warn!("could not mkdir {}: {}", full.display(), e);
        }
        self.change_access(key, state);
    }

    /// Apply mode, ownership and mtime from a peer state.
    pub fn change_access(&self, key: &str, state: &FileState) {
        let full = self.full_path(key);
        if let Err(e) = fs::set_permissions(&full, fs::Permissions::from_mode(state.mode & 0o7777))
        {
            debug!("chmod {} failed: {}", full.display(), e);
        }
        if let Err(e) = std::os::unix::fs::chown(&full, Some(state.uid), Some(state.gid)) {
            debug!("chown {} failed: {}", full.display(), e);
        }
        set_file_times(&full, state.mtime);
    }

    /// Create a symlink at `key` pointing at `target`.
    pub fn make_link(&self, key: &str, target: &str) {
        self.remove(key);
        let full = self.full_path(key);
        match std::os::unix::fs::symlink(target, &full) {
            Ok(()) => info!("link created {} -> {}", full.display(), target),
            Err(e) => warn!("symlink {} failed: {}", full.display(), e),
        }
    }

    pub fn read_link(&self, key: &str) -> String {
        fs::read_link(self.full_path(key))
            .map(|t| t.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Back up `key` before a conflicting overwrite.
    pub fn backup(&mut self, key: &str) {
        match treesync_index::backup::backup(&mut self.db, key) {
            Ok(Some(name)) => debug!("backed up {key} as {name}"),
            Ok(None) => {}
            Err(e) => warn!("backup of {key} failed: {e}"),
        }
    }
}

fn compile_patterns(sources: &[String]) -> Vec<Pattern> {
    sources
        .iter()
        .filter_map(|src| match Pattern::new(src) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("ignoring malformed pattern {src}: {e}");
                None
            }
        })
        .collect()
}

fn set_file_times(path: &Path, mtime: i64) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let times = libc::utimbuf {
        actime: mtime as libc::time_t,
        modtime: mtime as libc::time_t,
    };
    // Missing targets (dangling links) are fine to ignore.
    unsafe {
        libc::utime(c_path.as_ptr(), &times);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path, state: &Path) -> WatchPointOptions {
        WatchPointOptions {
            path: dir.to_path_buf(),
            export: "share".into(),
            readonly: false,
            include: Vec::new(),
            exclude: Vec::new(),
            state_root: state.to_path_buf(),
        }
    }

    #[test]
    fn scratch_dir_is_recreated_and_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(SCRATCH_DIR)).unwrap();
        fs::write(dir.path().join(SCRATCH_DIR).join("stale"), b"x").unwrap();

        let mut wp = WatchPoint::new(options(dir.path(), state.path())).unwrap();
        assert!(!dir.path().join(SCRATCH_DIR).join("stale").exists());

        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        let changes = wp.rescan("", None);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "/real.txt");
    }

    #[test]
    fn include_beats_exclude_and_default_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), state.path());
        opts.include = vec![format!("{}/keep.log", dir.path().display())];
        opts.exclude = vec![format!("{}/*.log", dir.path().display())];
        let wp = WatchPoint::new(opts).unwrap();

        assert!(wp.valid_key("/keep.log"));
        assert!(!wp.valid_key("/drop.log"));
        assert!(wp.valid_key("/unrelated.txt"));
        assert!(!wp.valid_key(&format!("/{SCRATCH_DIR}/anything")));
    }

    #[test]
    fn state_dir_is_keyed_by_flattened_path() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let wp = WatchPoint::new(options(dir.path(), state.path())).unwrap();

        let flat: String = dir
            .path()
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        assert_eq!(wp.state_dir(), state.path().join(flat));
        assert!(wp.state_dir().is_dir());
    }

    #[test]
    fn transient_snapshots_live_in_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"1").unwrap();

        let mut wp = WatchPoint::new(options(dir.path(), state.path())).unwrap();
        wp.rescan("", None);
        let (key, size) = wp.create_state_file(true).unwrap();
        assert!(key.starts_with(&format!("/{SCRATCH_DIR}/")));
        assert!(size > 0);
        assert!(wp.full_path(&key).exists());

        let (persist_key, _) = wp.create_state_file(false).unwrap();
        assert!(persist_key.is_empty());
        assert!(wp.last_sync_state_path().exists());
    }

    #[test]
    fn readonly_denies_writes() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"1").unwrap();

        let mut opts = options(dir.path(), state.path());
        opts.readonly = true;
        let wp = WatchPoint::new(opts).unwrap();

        let (writable, probed) = wp.is_writeable("/f");
        assert!(!writable);
        assert!(probed.is_regular());
    }
}
