//! The transport seam between the engine and its owner.

use treesync_proto::MessageType;

/// One session's view of its connection.
///
/// The implementation stamps the session's watchpoint id into the frame
/// header and applies the connection's current compression level.
pub trait Wire {
    /// Queue a frame. Queueing never fails; transport errors surface as
    /// connection teardown.
    fn send(&mut self, msg: MessageType, payload: &[u8]);

    /// True while previously queued bytes are still unflushed. Producers
    /// of bulk blocks suspend on this and resume on the write-available
    /// tick.
    fn write_bytes_pending(&self) -> bool;
}
