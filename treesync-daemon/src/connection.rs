//! One TCP peer: framed reader/writer tasks, per-connection compression
//! and throughput state, session slots by watchpoint id, and the list of
//! advisory file locks held on behalf of the peer.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use treesync_engine::{LockKind, Session, Wire};
use treesync_proto::{encode_frame, FrameHeader, MessageType, HEADER_LEN, MAX_COPY_SIZE};

use crate::daemon::Event;

pub type ConnId = u64;

/// Block-bearing messages open a throughput measurement window...
const WINDOW_OPENERS: [MessageType; 4] = [
    MessageType::RsyncDeltaBlock,
    MessageType::FullSyncLog,
    MessageType::RsyncSigBlock,
    MessageType::SyncLogBlock,
];

/// ...and their end markers close it.
const WINDOW_CLOSERS: [MessageType; 5] = [
    MessageType::RsyncAbort,
    MessageType::RsyncDeltaEnd,
    MessageType::RsyncSigEnd,
    MessageType::FullSyncLogEnd,
    MessageType::SyncLogEnd,
];

/// Speeds at or above this disable compression entirely.
const FAST_LINK: u32 = 1_000_000;

pub struct SessionSlot {
    pub session: Session,
    pub wp_index: usize,
}

struct HeldLock {
    path: String,
    file: std::fs::File,
    pub wp_index: usize,
}

pub struct Connection {
    pub id: ConnId,
    pub is_client: bool,
    /// Pool key for importing connections.
    pub pool_key: Option<String>,
    pub peer: String,
    pub sessions: Vec<Option<SessionSlot>>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
    /// zlib level for outgoing payloads: 0 (off) or 4..=9.
    compression: u32,
    upload_speed: u32,
    download_speed: u32,
    window: Option<SpeedWindow>,
    locks: Vec<HeldLock>,
    pub banner_verified: bool,
}

struct SpeedWindow {
    started: Instant,
    bytes: usize,
    wp_id: u8,
}

impl Connection {
    /// Wrap an established socket: spawn its reader and writer tasks and
    /// hand frames to the event loop.
    pub fn spawn(
        id: ConnId,
        stream: tokio::net::TcpStream,
        is_client: bool,
        pool_key: Option<String>,
        events: mpsc::Sender<Event>,
    ) -> Connection {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let reader = tokio::spawn(read_loop(id, read_half, events.clone()));
        let writer = tokio::spawn(write_loop(id, write_half, writer_rx, pending.clone(), events));

        info!("connection {id} with {peer} established");
        Connection {
            id,
            is_client,
            pool_key,
            peer,
            sessions: Vec::new(),
            writer_tx,
            pending,
            reader,
            writer,
            compression: 0,
            upload_speed: 0,
            download_speed: 0,
            window: None,
            locks: Vec::new(),
            banner_verified: false,
        }
    }

    /// A wire handle for one session slot; cheap to construct per event.
    pub fn wire(&self, wp_id: u8) -> ConnWire {
        ConnWire {
            wp_id,
            level: self.compression,
            writer_tx: self.writer_tx.clone(),
            pending: self.pending.clone(),
        }
    }

    pub fn write_bytes_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed) > 0
    }

    /// Measure inbound throughput across one block window and report a
    /// deviation above 20% back to the sender.
    pub fn track_speed(&mut self, msg: MessageType, wp_id: u8, payload_len: usize) {
        match self.window.as_mut() {
            None => {
                if WINDOW_OPENERS.contains(&msg) {
                    self.window = Some(SpeedWindow {
                        started: Instant::now(),
                        bytes: payload_len + HEADER_LEN,
                        wp_id,
                    });
                }
            }
            Some(window) => {
                window.bytes += payload_len + HEADER_LEN;
                if window.wp_id != wp_id {
                    return;
                }
                if !WINDOW_CLOSERS.contains(&msg) {
                    return;
                }
                let window = self.window.take().expect("window");
                if window.bytes <= 2 * MAX_COPY_SIZE {
                    return;
                }

                let millis = window.started.elapsed().as_millis() as u64;
                let speed = if millis > 0 {
                    ((window.bytes as u64 * 1000 / millis).min(FAST_LINK as u64)) as u32
                } else {
                    FAST_LINK
                };

                let low = self.download_speed / 10 * 8;
                let high = self.download_speed / 10 * 12;
                if speed < low || high < speed {
                    info!(
                        "connection {}: download speed {} -> {}",
                        self.id, self.download_speed, speed
                    );
                    let delta = speed as i64 - self.download_speed as i64;
                    self.download_speed = speed;
                    self.wire(0)
                        .send(MessageType::AdjustSpeed, &(delta as i32).to_le_bytes());
                }
            }
        }
    }

    /// Peer feedback: adapt the outgoing compression level. Slow links
    /// compress harder (4..9); fast links do not compress at all.
    pub fn adjust_speed(&mut self, delta: i32) {
        self.upload_speed = self.upload_speed.saturating_add_signed(delta);
        if self.upload_speed < FAST_LINK {
            if delta > 0 || self.compression == 0 {
                if self.compression < 4 {
                    self.compression = 4;
                } else if self.compression < 9 {
                    self.compression += 1;
                }
            } else if self.compression > 4 {
                self.compression -= 1;
            }
            debug!("connection {}: compression level {}", self.id, self.compression);
        } else {
            self.compression = 0;
        }
    }

    /// Take an advisory lock for the peer. One lock per path per
    /// connection; a second request is a no-op.
    pub fn lock_file(&mut self, full_path: &str, kind: LockKind, wp_index: usize) -> bool {
        let position = match self
            .locks
            .binary_search_by(|held| held.path.as_str().cmp(full_path))
        {
            Ok(_) => return false,
            Err(position) => position,
        };

        info!(
            "locking {} for {}",
            full_path,
            if kind == LockKind::Write { "writing" } else { "reading" }
        );
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(full_path)
        {
            Ok(file) => file,
            Err(e) => {
                debug!("cannot open {full_path} for locking: {e}");
                return false;
            }
        };

        let mut fl = libc::flock {
            l_type: if kind == LockKind::Read {
                libc::F_RDLCK as libc::c_short
            } else {
                libc::F_WRLCK as libc::c_short
            },
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        // Best effort, like the rest of the advisory lock relay.
        unsafe {
            libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl);
        }

        self.locks.insert(
            position,
            HeldLock {
                path: full_path.to_string(),
                file,
                wp_index,
            },
        );
        true
    }

    /// Release a peer lock. Returns the owning watchpoint when a lock
    /// was actually held.
    pub fn unlock_file(&mut self, full_path: &str) -> Option<usize> {
        let position = self
            .locks
            .binary_search_by(|held| held.path.as_str().cmp(full_path))
            .ok()?;
        let held = self.locks.remove(position);
        info!("unlocked {}", held.path);
        // Closing the fd drops the advisory lock.
        drop(held.file);
        Some(held.wp_index)
    }

    /// Paths still locked at teardown, released by dropping.
    pub fn drain_locks(&mut self) -> Vec<(String, usize)> {
        self.locks
            .drain(..)
            .map(|held| (held.path, held.wp_index))
            .collect()
    }

    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// The engine-facing wire for one (connection, watchpoint id) pair.
pub struct ConnWire {
    wp_id: u8,
    level: u32,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
}

impl ConnWire {
    /// Queue a frame without going through the trait object.
    pub fn send_raw(&mut self, msg: MessageType, payload: &[u8]) {
        match encode_frame(msg as u8, self.wp_id, payload, self.level) {
            Ok(frame) => {
                self.pending.fetch_add(frame.len(), Ordering::Relaxed);
                // A closed channel means the connection is tearing down;
                // the frame is moot.
                let _ = self.writer_tx.send(frame);
            }
            Err(e) => error!("cannot encode {} frame: {}", msg.name(), e),
        }
    }
}

impl Wire for ConnWire {
    fn send(&mut self, msg: MessageType, payload: &[u8]) {
        self.send_raw(msg, payload);
    }

    fn write_bytes_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed) > 0
    }
}

async fn read_loop(id: ConnId, mut socket: OwnedReadHalf, events: mpsc::Sender<Event>) {
    loop {
        let mut head_raw = [0u8; HEADER_LEN];
        if socket.read_exact(&mut head_raw).await.is_err() {
            break;
        }
        let head = FrameHeader::from_bytes(head_raw);

        let mut payload = vec![0u8; head.length as usize];
        if socket.read_exact(&mut payload).await.is_err() {
            break;
        }

        if events
            .send(Event::Frame {
                conn_id: id,
                head,
                payload,
            })
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = events.send(Event::ConnClosed { conn_id: id }).await;
}

async fn write_loop(
    id: ConnId,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    events: mpsc::Sender<Event>,
) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len();
        if socket.write_all(&frame).await.is_err() {
            let _ = events.send(Event::ConnClosed { conn_id: id }).await;
            return;
        }
        if pending.fetch_sub(len, Ordering::Relaxed) == len {
            // Buffer drained: wake suspended bulk producers.
            let _ = events.send(Event::WriteDrained { conn_id: id }).await;
        }
    }
}
