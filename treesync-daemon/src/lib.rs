//! The treesync daemon: configuration, transport, reconnect handling,
//! filesystem watching and the single event loop tying the engine to the
//! outside world.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod importer;
pub mod lockpoll;
pub mod watcher;

/// Version banner exchanged right after accept. Peers must match the
/// name and the first two version components.
pub fn banner() -> String {
    format!("treesyncd {}", env!("CARGO_PKG_VERSION"))
}
