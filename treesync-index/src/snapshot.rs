//! Snapshot persistence: the serialized image of a `StateDb`, written
//! after a successful sync and read back as the third witness of the next
//! full-sync reconciliation.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use treesync_proto::{FileState, RecordReader, RecordWriter};

use crate::statedb::StateDb;
use crate::Result;

/// Serialize the whole database to `path`, returning the file size.
pub fn write_to_file(db: &StateDb, path: &Path) -> Result<u64> {
    let file = File::create(path)?;
    let mut writer = RecordWriter::new(BufWriter::new(file));
    for (key, state) in db.iter() {
        writer.write(key, state)?;
    }
    let mut out = writer.into_inner();
    out.flush()?;
    Ok(out.get_ref().metadata()?.len())
}

/// Load a snapshot file into a sorted map. Missing files read as empty,
/// matching a watchpoint that has never completed a full sync.
pub fn load_from_file(path: &Path) -> Result<BTreeMap<String, FileState>> {
    let mut map = BTreeMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(map),
        Err(e) => return Err(e.into()),
    };
    let mut reader = RecordReader::new(BufReader::new(file));
    while let Some((key, state)) = reader.read()? {
        map.insert(key, state);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn snapshot_roundtrip_preserves_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let mut db = StateDb::new(dir.path());
        let mut changes = Vec::new();
        db.change_db("", None, &|_| true, &mut changes);

        let snap = dir.path().join("state");
        let size = write_to_file(&db, &snap).unwrap();
        assert!(size > 0);

        let loaded = load_from_file(&snap).unwrap();
        assert_eq!(loaded.len(), db.len());
        for (key, state) in db.iter() {
            assert_eq!(loaded.get(key), Some(state), "key {key}");
        }
    }

    #[test]
    fn missing_snapshot_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_from_file(&dir.path().join("never-written")).unwrap();
        assert!(map.is_empty());
    }
}
