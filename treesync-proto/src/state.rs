//! The per-path file state fingerprint.
//!
//! Serialized bit-exact: peers and the on-disk snapshot share this layout.

use std::io::Read;

/// Change actions. `0x40` was once a directory-change marker; it stays
/// reserved because reusing it would change the wire protocol.
pub mod action {
    pub const NONE: u16 = 0;
    pub const REMOVED: u16 = 0x01;
    pub const NEWACCESS: u16 = 0x02;
    pub const CREATED: u16 = 0x04;
    pub const CHANGED: u16 = 0x08;
    pub const MKDIRED: u16 = 0x10;
    pub const RMDIRED: u16 = 0x20;
    pub const NEWLINK: u16 = 0x80;

    pub fn name(action: u16) -> &'static str {
        match action {
            NONE => "none",
            REMOVED => "removed",
            NEWACCESS => "newaccess",
            CREATED => "created",
            CHANGED => "changed",
            MKDIRED => "mkdired",
            RMDIRED => "rmdired",
            NEWLINK => "newlink",
            _ => "invalid",
        }
    }
}

/// Serialized length of a [`FileState`]: 16 + 4 + 4 + 4 + 8 + 8 + 8 + 2.
pub const STATE_WIRE_LEN: usize = 54;

// POSIX file-type bits; stable values, used on the wire inside `mode`.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;

/// Metadata fingerprint of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileState {
    /// MD4 of the content for regular files, zero otherwise.
    pub md4: [u8; 16],
    pub uid: u32,
    pub gid: u32,
    /// POSIX mode including the file-type bits.
    pub mode: u32,
    /// Seconds since the epoch.
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
    /// One of the [`action`] values.
    pub action: u16,
}

impl FileState {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn action_name(&self) -> &'static str {
        action::name(self.action)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.md4);
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.action.to_le_bytes());
    }

    pub fn from_bytes(raw: &[u8; STATE_WIRE_LEN]) -> Self {
        let mut md4 = [0u8; 16];
        md4.copy_from_slice(&raw[0..16]);
        FileState {
            md4,
            uid: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            gid: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            mode: u32::from_le_bytes(raw[24..28].try_into().unwrap()),
            mtime: i64::from_le_bytes(raw[28..36].try_into().unwrap()),
            ctime: i64::from_le_bytes(raw[36..44].try_into().unwrap()),
            size: u64::from_le_bytes(raw[44..52].try_into().unwrap()),
            action: u16::from_le_bytes(raw[52..54].try_into().unwrap()),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut raw = [0u8; STATE_WIRE_LEN];
        reader.read_exact(&mut raw)?;
        Ok(Self::from_bytes(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileState {
        FileState {
            md4: *b"0123456789abcdef",
            uid: 1000,
            gid: 100,
            mode: S_IFREG | 0o644,
            mtime: 1_700_000_000,
            ctime: 1_700_000_001,
            size: 4096,
            action: action::CHANGED,
        }
    }

    #[test]
    fn codec_roundtrip() {
        let state = sample();
        let mut buf = Vec::new();
        state.write_to(&mut buf);
        assert_eq!(buf.len(), STATE_WIRE_LEN);

        let decoded = FileState::from_bytes(&buf.as_slice().try_into().unwrap());
        assert_eq!(decoded, state);
    }

    #[test]
    fn type_bits() {
        let mut state = sample();
        assert!(state.is_regular());
        state.mode = S_IFDIR | 0o755;
        assert!(state.is_dir());
        state.mode = S_IFLNK | 0o777;
        assert!(state.is_symlink());
    }

    #[test]
    fn short_read_is_eof() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 10]);
        assert!(FileState::read_from(&mut cursor).is_err());
    }
}
