//! Content differencing for treesync: block signatures over the stale
//! copy, a delta stream computed against them from the fresh copy, and an
//! incremental patcher that rebuilds the fresh copy next to the stale one.
//!
//! The three jobs mirror the classic rsync split. Producers emit bounded
//! blocks and can be suspended between blocks, which is what lets the sync
//! dialogs yield on write backpressure and resume on the write-available
//! tick.

pub mod delta;
pub mod hash;
pub mod patch;
pub mod signature;

pub use delta::DeltaJob;
pub use hash::{md4_digest, RollingHash};
pub use patch::PatchJob;
pub use signature::{Signature, SignatureIndex, SignatureJob, SignatureParser};

use thiserror::Error;

/// Signature block length. Matches the historical default of the codec
/// this replaces; both peers must agree, and the value travels in the
/// signature header anyway.
pub const BLOCK_LEN: usize = 2048;

/// Upper bound on one emitted wire block.
pub const MAX_BLOCK: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt delta stream: {0}")]
    Corrupt(&'static str),

    #[error("corrupt signature stream: {0}")]
    BadSignature(&'static str),
}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Outcome of driving a producer job once.
#[derive(Debug, PartialEq, Eq)]
pub enum Drive {
    /// A block was produced; send it and, if the transport is congested,
    /// come back on the next write-available tick.
    Block(Vec<u8>),
    /// The job has emitted everything.
    Done,
}
