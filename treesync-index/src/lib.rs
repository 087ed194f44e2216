//! Per-watchpoint state: the authoritative path → fingerprint map, change
//! detection by rescanning, pending-change logs and conflict backups.
//!
//! Paths are stored relative to the watchpoint root with a leading `/`
//! (`"/sub/file.txt"`), sorted as plain strings. Sorted iteration
//! guarantees parents precede their subtrees, which the rmdir-collapse
//! logic relies on.

pub mod backup;
pub mod modlog;
pub mod snapshot;
pub mod statedb;

pub use modlog::ModLog;
pub use statedb::{Change, StateDb};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no state entry for {0}")]
    UnknownPath(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// `true` iff `child` lies below `parent` in key order.
///
/// Plain prefix semantics, matching the key comparison: the serialized
/// containers are ordered by full-string compare, so a parent always
/// immediately precedes its subtree.
pub fn is_parent_of(parent: &str, child: &str) -> bool {
    child.starts_with(parent)
}

/// Hash a file's content. Dangling symlinks and unreadable files hash as
/// empty input; the caller treats the path as changed either way.
pub fn md4_file(path: &std::path::Path) -> [u8; 16] {
    use md4::{Digest, Md4};
    use std::io::Read;

    let mut hasher = Md4::new();
    if let Ok(mut file) = std::fs::File::open(path) {
        let mut buf = [0u8; 8192];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_is_a_prefix_test() {
        assert!(is_parent_of("/a", "/a/b"));
        assert!(is_parent_of("/a", "/a"));
        assert!(!is_parent_of("/a/b", "/a"));
        assert!(!is_parent_of("/b", "/a/b"));
    }

    #[test]
    fn md4_of_missing_file_is_md4_of_empty() {
        use md4::{Digest, Md4};
        let empty: [u8; 16] = Md4::digest(b"").into();
        assert_eq!(md4_file(std::path::Path::new("/nonexistent-treesync")), empty);
    }
}
