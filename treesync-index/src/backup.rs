//! Conflict backups: `dir/name.ext` becomes `dir/name-<n>.ext` with the
//! next free revision number, keeping the losing side's bytes around
//! before a conflicting peer version overwrites them.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use tracing::{debug, info};

use crate::statedb::StateDb;
use crate::{IndexError, Result};

const S_IWUSR: u32 = 0o200;
const S_IWGRP: u32 = 0o020;
const S_IROTH: u32 = 0o004;

/// Back up `key` inside the tree. Returns the backup's key, or `None`
/// when an identical backup already exists.
///
/// Directories are renamed aside; files are copied. The backup loses
/// owner-write, group-write and other-read but keeps its owner.
pub fn backup(db: &mut StateDb, key: &str) -> Result<Option<String>> {
    let state = *db
        .get(key)
        .ok_or_else(|| IndexError::UnknownPath(key.to_string()))?;

    let name_start = key.rfind('/').map(|p| p + 1).unwrap_or(0);
    let ext_pos = key[name_start..].rfind('.').map(|p| name_start + p);
    let stem = ext_pos.map(|p| &key[..p]).unwrap_or(key);
    let ext = ext_pos.map(|p| &key[p..]).unwrap_or("");
    let base = format!("{stem}-");

    // Highest existing revision among siblings with the same base + ext;
    // an existing backup with identical content makes this a no-op.
    let mut revision = 0u32;
    for (sibling, sib_state) in db.range_from(&base) {
        if !sibling.starts_with(&base) {
            break;
        }
        let rest = &sibling[base.len()..];
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 || &rest[digits..] != ext {
            continue;
        }
        if let Ok(rev) = rest[..digits].parse::<u32>() {
            revision = revision.max(rev);
            if sib_state.md4 == state.md4 {
                debug!("not backing up {key}: {sibling} has identical content");
                return Ok(None);
            }
        }
    }

    let backup_key = format!("{base}{}{ext}", revision + 1);
    let src = db.full_path(key);
    let dst = db.full_path(&backup_key);

    if state.is_dir() {
        fs::rename(&src, &dst)?;
    } else {
        fs::copy(&src, &dst)?;
    }
    db.renew_silent(key);

    let stripped = state.mode & !(S_IWUSR | S_IWGRP | S_IROTH);
    fs::set_permissions(&dst, fs::Permissions::from_mode(stripped & 0o7777))?;
    if let Err(e) = std::os::unix::fs::chown(&dst, Some(state.uid), Some(state.gid)) {
        debug!("cannot chown backup {}: {}", dst.display(), e);
    }

    info!("conflicting files, created backup {key} -> {backup_key}");
    Ok(Some(backup_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn scanned_db(dir: &std::path::Path) -> StateDb {
        let mut db = StateDb::new(dir);
        let mut changes = Vec::new();
        db.change_db("", None, &|_| true, &mut changes);
        db
    }

    #[test]
    fn first_backup_gets_revision_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("doc.txt"), b"mine").unwrap();

        let mut db = scanned_db(dir.path());
        let name = backup(&mut db, "/doc.txt").unwrap().unwrap();
        assert_eq!(name, "/doc-1.txt");
        assert_eq!(
            fs::read(dir.path().join("doc-1.txt")).unwrap(),
            b"mine"
        );
        // Source still in place for files.
        assert!(dir.path().join("doc.txt").exists());
    }

    #[test]
    fn revision_counts_past_existing_backups() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("doc.txt"), b"current").unwrap();
        fs::write(dir.path().join("doc-1.txt"), b"old one").unwrap();
        fs::write(dir.path().join("doc-7.txt"), b"old seven").unwrap();

        let mut db = scanned_db(dir.path());
        let name = backup(&mut db, "/doc.txt").unwrap().unwrap();
        assert_eq!(name, "/doc-8.txt");
    }

    #[test]
    fn identical_content_is_not_backed_up_twice() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("doc.txt"), b"same").unwrap();
        fs::write(dir.path().join("doc-1.txt"), b"same").unwrap();

        let mut db = scanned_db(dir.path());
        assert!(backup(&mut db, "/doc.txt").unwrap().is_none());
        assert!(!dir.path().join("doc-2.txt").exists());
    }

    #[test]
    fn extensionless_files_get_plain_revisions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), b"all:").unwrap();

        let mut db = scanned_db(dir.path());
        let name = backup(&mut db, "/Makefile").unwrap().unwrap();
        assert_eq!(name, "/Makefile-1");
    }

    #[test]
    fn backup_mode_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        fs::write(&file, b"payload").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o664)).unwrap();

        let mut db = scanned_db(dir.path());
        backup(&mut db, "/doc.txt").unwrap();

        let mode = fs::metadata(dir.path().join("doc-1.txt")).unwrap().mode() & 0o7777;
        // 0664 minus owner-write, group-write, other-read.
        assert_eq!(mode, 0o440);
    }

    #[test]
    fn directories_are_renamed_aside() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("project")).unwrap();
        fs::write(dir.path().join("project/f"), b"x").unwrap();

        let mut db = scanned_db(dir.path());
        let name = backup(&mut db, "/project").unwrap().unwrap();
        assert_eq!(name, "/project-1");
        assert!(!dir.path().join("project").exists());
        assert!(dir.path().join("project-1/f").exists());
    }
}
