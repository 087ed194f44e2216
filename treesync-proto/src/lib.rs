//! Wire protocol types for treesync
//!
//! Everything two peers must agree on bit-exactly lives here: the frame
//! header, the message ordinals, the compression framing, the fixed
//! `FileState` layout and the prefix-compressed record serializer that is
//! used both for on-disk snapshots and for log blocks on the wire.

pub mod frame;
pub mod serializer;
pub mod state;

pub use frame::{decode_payload, encode_frame, FrameHeader, COMPRESS_BIT, HEADER_LEN};
pub use serializer::{RecordReader, RecordWriter};
pub use state::{action, FileState, STATE_WIRE_LEN};

use thiserror::Error;

/// Upper bound for a serialized log or delta block. Larger payloads are
/// split; the u16 frame length leaves headroom for compression expansion.
pub const MAX_COPY_SIZE: usize = 16 * 1024;

/// Payloads above this size are candidates for zlib compression.
pub const COMPRESS_THRESHOLD: usize = 1024;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload of {0} bytes exceeds frame limit")]
    Oversize(usize),

    #[error("zlib decompression failed: {0}")]
    Decompress(String),

    #[error("decompressed length {actual} does not match declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed record in block")]
    MalformedRecord,
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Message ordinals, assigned sequentially from ASCII `'A'`.
///
/// The order is part of the wire contract; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Start = b'A',
    Reject,
    Accept,
    Backup,
    RegisterWatchPoint,

    FullSyncStart,
    FullSyncState,
    FullSyncLog,
    FullSyncLogEnd,
    FullSyncComplete,

    SyncStart,
    SyncStartOk,
    SyncLogBlock,
    SyncLogEnd,
    SyncComplete,

    RsyncStart,
    RsyncAbort,
    RsyncSigBlock,
    RsyncSigEnd,
    RsyncDeltaBlock,
    RsyncDeltaEnd,

    GetLink,
    LinkDest,

    ClientKey,

    WriteAvail,

    AdjustSpeed,

    CreateWriteLock,
    CreateReadLock,
    ReleaseLock,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        // One arm per wire ordinal, in protocol order.
        Some(match value {
            b'A' => MessageType::Start,
            b'B' => MessageType::Reject,
            b'C' => MessageType::Accept,
            b'D' => MessageType::Backup,
            b'E' => MessageType::RegisterWatchPoint,
            b'F' => MessageType::FullSyncStart,
            b'G' => MessageType::FullSyncState,
            b'H' => MessageType::FullSyncLog,
            b'I' => MessageType::FullSyncLogEnd,
            b'J' => MessageType::FullSyncComplete,
            b'K' => MessageType::SyncStart,
            b'L' => MessageType::SyncStartOk,
            b'M' => MessageType::SyncLogBlock,
            b'N' => MessageType::SyncLogEnd,
            b'O' => MessageType::SyncComplete,
            b'P' => MessageType::RsyncStart,
            b'Q' => MessageType::RsyncAbort,
            b'R' => MessageType::RsyncSigBlock,
            b'S' => MessageType::RsyncSigEnd,
            b'T' => MessageType::RsyncDeltaBlock,
            b'U' => MessageType::RsyncDeltaEnd,
            b'V' => MessageType::GetLink,
            b'W' => MessageType::LinkDest,
            b'X' => MessageType::ClientKey,
            b'Y' => MessageType::WriteAvail,
            b'Z' => MessageType::AdjustSpeed,
            b'[' => MessageType::CreateWriteLock,
            b'\\' => MessageType::CreateReadLock,
            b']' => MessageType::ReleaseLock,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Start => "Start",
            MessageType::Reject => "Reject",
            MessageType::Accept => "Accept",
            MessageType::Backup => "Backup",
            MessageType::RegisterWatchPoint => "RegisterWatchPoint",
            MessageType::FullSyncStart => "FullSyncStart",
            MessageType::FullSyncState => "FullSyncState",
            MessageType::FullSyncLog => "FullSyncLog",
            MessageType::FullSyncLogEnd => "FullSyncLogEnd",
            MessageType::FullSyncComplete => "FullSyncComplete",
            MessageType::SyncStart => "SyncStart",
            MessageType::SyncStartOk => "SyncStartOk",
            MessageType::SyncLogBlock => "SyncLogBlock",
            MessageType::SyncLogEnd => "SyncLogEnd",
            MessageType::SyncComplete => "SyncComplete",
            MessageType::RsyncStart => "RsyncStart",
            MessageType::RsyncAbort => "RsyncAbort",
            MessageType::RsyncSigBlock => "RsyncSigBlock",
            MessageType::RsyncSigEnd => "RsyncSigEnd",
            MessageType::RsyncDeltaBlock => "RsyncDeltaBlock",
            MessageType::RsyncDeltaEnd => "RsyncDeltaEnd",
            MessageType::GetLink => "GetLink",
            MessageType::LinkDest => "LinkDest",
            MessageType::ClientKey => "ClientKey",
            MessageType::WriteAvail => "wavail",
            MessageType::AdjustSpeed => "AdjustSpeed",
            MessageType::CreateWriteLock => "CreateWriteLock",
            MessageType::CreateReadLock => "CreateReadLock",
            MessageType::ReleaseLock => "ReleaseLock",
        }
    }
}

/// Compare two `"name MAJOR.MINOR.PATCH"` banners, requiring the name and
/// the first two version components to match.
pub fn versions_compatible(ours: &str, theirs: &str) -> bool {
    match (ours.rfind('.'), theirs.rfind('.')) {
        (Some(a), Some(b)) => ours[..a] == theirs[..b],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_match_wire_contract() {
        assert_eq!(MessageType::Start as u8, b'A');
        assert_eq!(MessageType::RegisterWatchPoint as u8, b'E');
        assert_eq!(MessageType::SyncStart as u8, b'K');
        assert_eq!(MessageType::RsyncStart as u8, b'P');
        assert_eq!(MessageType::ClientKey as u8, b'X');
        assert_eq!(MessageType::WriteAvail as u8, b'Y');
        assert_eq!(MessageType::AdjustSpeed as u8, b'Z');
        assert_eq!(MessageType::ReleaseLock as u8, b']');
    }

    #[test]
    fn roundtrip_from_u8() {
        for raw in 0u8..=255 {
            if let Some(msg) = MessageType::from_u8(raw) {
                assert_eq!(msg as u8, raw);
            }
        }
        assert!(MessageType::from_u8(b'A' - 1).is_none());
        assert!(MessageType::from_u8(b']' + 1).is_none());
    }

    #[test]
    fn version_check_ignores_patch_level() {
        assert!(versions_compatible("treesyncd 0.3.1", "treesyncd 0.3.9"));
        assert!(!versions_compatible("treesyncd 0.3.1", "treesyncd 0.4.0"));
        assert!(!versions_compatible("treesyncd 0.3.1", "other 0.3.1"));
        assert!(!versions_compatible("treesyncd 0.3.1", "garbage"));
    }
}
