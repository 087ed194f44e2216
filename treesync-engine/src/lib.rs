//! The synchronization engine.
//!
//! Everything protocol-shaped lives here, behind the [`Wire`] trait:
//! watchpoint policy and filesystem application, the per-session state
//! machine with its two alternating modification logs, the dialog
//! pushdown automaton, three-way reconciliation and uid/gid translation.
//! The daemon supplies real sockets and timers; the tests supply an
//! in-memory loopback.
//!
//! Mutation of cross-session state (rescans, lock fan-out, timers) is not
//! performed inline. Dialog steps return [`Effect`] values which the
//! owning event loop applies once the session borrow ends; this keeps the
//! single-threaded cooperative model free of re-entrancy.

pub mod dialog;
pub mod locks;
pub mod reconcile;
pub mod session;
pub mod translator;
pub mod watchpoint;
pub mod wire;

pub use locks::{LockToken, SoftLocks};
pub use session::{Ctx, Effect, Session};
pub use translator::IdTranslator;
pub use watchpoint::{WatchPoint, WatchPointOptions};
pub use wire::Wire;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] treesync_index::IndexError),

    #[error("watchpoint path {0} is not a directory")]
    NotADirectory(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Advisory lock kinds relayed between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Release,
}
