//! The event loop. Every piece of mutable engine state lives here and is
//! touched from exactly one task; sockets, timers, the watcher and the
//! lock poller only send messages in.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use treesync_engine::{
    Ctx, Effect, IdTranslator, LockKind, Session, SoftLocks, WatchPoint, WatchPointOptions,
};
use treesync_index::statedb::Change;
use treesync_proto::{decode_payload, versions_compatible, FrameHeader, MessageType};

use crate::config::{lookup_user, Config, ImportConfig};
use crate::connection::{ConnId, Connection, SessionSlot};
use crate::importer::{dial, start_tunnel, ReconnectState, Tunnel, SSH_GRACE};
use crate::lockpoll::LockPoll;
use crate::watcher::DirWatcher;

const EVENT_QUEUE: usize = 1024;
const SYNC_TIMER: Duration = Duration::from_secs(1);
const LOCK_POLL_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Event {
    Accepted {
        stream: tokio::net::TcpStream,
    },
    Frame {
        conn_id: ConnId,
        head: FrameHeader,
        payload: Vec<u8>,
    },
    ConnClosed {
        conn_id: ConnId,
    },
    WriteDrained {
        conn_id: ConnId,
    },
    DirChanged {
        wp_index: usize,
        dir: PathBuf,
    },
    SyncTimer {
        conn_id: ConnId,
        wp_id: u8,
    },
    ImportTimer {
        wp_index: usize,
    },
    LockPollTick,
    Shutdown,
}

struct PoolEntry {
    conn_id: Option<ConnId>,
    tunnel: Option<Tunnel>,
}

pub struct Daemon {
    config: Config,
    banner: String,
    client_key: String,
    key_home: Option<PathBuf>,
    watchpoints: Vec<WatchPoint>,
    imports: Vec<Vec<ImportConfig>>,
    reconnect: Vec<ReconnectState>,
    connections: HashMap<ConnId, Connection>,
    pool: HashMap<String, PoolEntry>,
    soft_locks: SoftLocks,
    lock_poll: LockPoll,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
    next_conn_id: ConnId,
    next_token: u64,
}

impl Daemon {
    pub fn new(config: Config, lock_polling: bool) -> Result<Daemon> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let mut watchpoints = Vec::new();
        let mut imports = Vec::new();
        for wp_config in &config.watchpoints {
            let wp = WatchPoint::new(WatchPointOptions {
                path: wp_config.path.clone(),
                export: wp_config.export.clone(),
                readonly: wp_config.readonly,
                include: wp_config.include.clone(),
                exclude: wp_config.exclude.clone(),
                state_root: config.state_root.clone(),
            })
            .with_context(|| format!("watchpoint {}", wp_config.path.display()))?;
            watchpoints.push(wp);
            imports.push(wp_config.imports.clone());
        }

        // Build the baseline state database for every tree. No sessions
        // are attached yet, so the discovered changes go nowhere.
        for wp in &mut watchpoints {
            let _ = wp.rescan("", None);
            info!("{}: {} entries tracked", wp.path(), wp.db.len());
        }

        let (client_key, key_home) = match lookup_user(&config.ssh_user) {
            Some((_, home)) => {
                let key_path = home.join(".ssh/id_rsa.pub");
                let key = std::fs::read_to_string(&key_path)
                    .map(|k| k.trim().to_string())
                    .unwrap_or_default();
                if key.is_empty() {
                    info!(
                        "no public key at {}, key exchange disabled",
                        key_path.display()
                    );
                }
                (key, Some(home))
            }
            None => {
                info!(
                    "user {} does not exist, key exchange disabled; \
                     provision it to enable tunnel logins",
                    config.ssh_user
                );
                (String::new(), None)
            }
        };

        let reconnect = (0..watchpoints.len())
            .map(|_| ReconnectState::new())
            .collect();

        Ok(Daemon {
            banner: crate::banner(),
            client_key,
            key_home,
            watchpoints,
            imports,
            reconnect,
            connections: HashMap::new(),
            pool: HashMap::new(),
            soft_locks: SoftLocks::new(),
            lock_poll: LockPoll::new(lock_polling),
            events_tx,
            events_rx: Some(events_rx),
            next_conn_id: 1,
            next_token: 1,
            config,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut rx = self.events_rx.take().expect("run() called twice");

        // Accept loop for exported watchpoints.
        if self.config.port != 0 {
            let listener = TcpListener::bind(("0.0.0.0", self.config.port))
                .await
                .with_context(|| format!("cannot listen on port {}", self.config.port))?;
            info!("listening on port {}", self.config.port);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            if tx.send(Event::Accepted { stream }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            });
        }

        let roots: Vec<(usize, PathBuf)> = self
            .watchpoints
            .iter()
            .enumerate()
            .map(|(index, wp)| (index, PathBuf::from(wp.path())))
            .collect();
        let _watcher = DirWatcher::start(roots, self.events_tx.clone())
            .context("cannot start directory watcher")?;

        if self.lock_poll.is_enabled() {
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(LOCK_POLL_TICK);
                loop {
                    tick.tick().await;
                    if tx.send(Event::LockPollTick).await.is_err() {
                        return;
                    }
                }
            });
        }

        for wp_index in 0..self.watchpoints.len() {
            if !self.imports[wp_index].is_empty() {
                self.arm_import_timer(wp_index, Duration::ZERO);
            }
        }

        while let Some(event) = rx.recv().await {
            match event {
                Event::Accepted { stream } => self.on_accepted(stream),
                Event::Frame {
                    conn_id,
                    head,
                    payload,
                } => self.on_frame(conn_id, head, payload).await,
                Event::ConnClosed { conn_id } => self.teardown(conn_id).await,
                Event::WriteDrained { conn_id } => self.on_write_drained(conn_id).await,
                Event::DirChanged { wp_index, dir } => self.on_dir_changed(wp_index, dir),
                Event::SyncTimer { conn_id, wp_id } => self.on_sync_timer(conn_id, wp_id).await,
                Event::ImportTimer { wp_index } => self.on_import_timer(wp_index).await,
                Event::LockPollTick => self.on_lock_poll(),
                Event::Shutdown => break,
            }
        }
        info!("event loop stopped");
        Ok(())
    }

    /* ---------------- connections ---------------- */

    fn on_accepted(&mut self, stream: tokio::net::TcpStream) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let conn = Connection::spawn(conn_id, stream, false, None, self.events_tx.clone());

        let mut banner = self.banner.clone().into_bytes();
        banner.push(0);
        conn.wire(0).send_raw(MessageType::Start, &banner);
        self.connections.insert(conn_id, conn);
    }

    async fn on_frame(&mut self, conn_id: ConnId, head: FrameHeader, payload: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };

        let payload = match decode_payload(head, payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("connection {conn_id}: {e}; dropping peer");
                self.teardown(conn_id).await;
                return;
            }
        };
        let Some(msg) = MessageType::from_u8(head.message()) else {
            debug!("connection {conn_id}: unknown opcode {:#x}", head.message());
            return;
        };

        conn.track_speed(msg, head.wp_id, payload.len());

        match msg {
            MessageType::AdjustSpeed => {
                if payload.len() >= 4 {
                    let delta = i32::from_le_bytes(payload[..4].try_into().expect("4 bytes"));
                    conn.adjust_speed(delta);
                }
            }
            MessageType::Start => {
                if conn.is_client {
                    let theirs = treesync_engine::session::text(&payload);
                    if versions_compatible(&self.banner, &theirs) {
                        info!("server version {theirs} accepted");
                        conn.banner_verified = true;
                        if !self.client_key.is_empty() {
                            conn.wire(0)
                                .send_raw(MessageType::ClientKey, self.client_key.as_bytes());
                        }
                    } else {
                        warn!("incompatible peer version {theirs}");
                        self.teardown(conn_id).await;
                    }
                }
            }
            MessageType::ClientKey => {
                let key = treesync_engine::session::text(&payload);
                self.accept_key(&key);
            }
            MessageType::RegisterWatchPoint => {
                let name = treesync_engine::session::text(&payload);
                self.register_watchpoint(conn_id, head.wp_id, &name);
            }
            _ => self.dispatch(conn_id, head.wp_id, msg, &payload).await,
        }
    }

    async fn dispatch(&mut self, conn_id: ConnId, wp_id: u8, msg: MessageType, payload: &[u8]) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let mut wire = conn.wire(wp_id);
        let Some(Some(slot)) = conn.sessions.get_mut(wp_id as usize) else {
            wire.send_raw(MessageType::Reject, &[]);
            return;
        };

        let wp_index = slot.wp_index;
        let mut fx = Vec::new();
        {
            let mut ctx = Ctx {
                wp: &mut self.watchpoints[wp_index],
                wire: &mut wire,
                locks: &mut self.soft_locks,
            };
            slot.session.on_frame(&mut ctx, msg, payload, &mut fx);
        }
        self.apply_effects(conn_id, wp_id, wp_index, fx).await;
    }

    async fn on_write_drained(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let slots: Vec<u8> = conn
            .sessions
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| index as u8))
            .collect();
        for wp_id in slots {
            // The synthetic write-available tick resumes suspended bulk
            // producers on every session of the connection.
            self.dispatch(conn_id, wp_id, MessageType::WriteAvail, &[])
                .await;
        }
    }

    async fn on_sync_timer(&mut self, conn_id: ConnId, wp_id: u8) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let mut wire = conn.wire(wp_id);
        let Some(Some(slot)) = conn.sessions.get_mut(wp_id as usize) else {
            return;
        };

        let wp_index = slot.wp_index;
        let mut fx = Vec::new();
        {
            let mut ctx = Ctx {
                wp: &mut self.watchpoints[wp_index],
                wire: &mut wire,
                locks: &mut self.soft_locks,
            };
            slot.session.on_timer(&mut ctx, &mut fx);
        }
        self.apply_effects(conn_id, wp_id, wp_index, fx).await;
    }

    async fn apply_effects(
        &mut self,
        conn_id: ConnId,
        wp_id: u8,
        wp_index: usize,
        fx: Vec<Effect>,
    ) {
        for effect in fx {
            match effect {
                Effect::ArmSyncTimer => self.arm_sync_timer(conn_id, wp_id),
                Effect::UnlockRescan { key, md4 } => self.unlock_rescan(wp_index, &key, md4),
                Effect::FileLock { key, kind } => self.peer_lock(conn_id, wp_index, &key, kind),
                Effect::Disconnect => self.teardown(conn_id).await,
            }
        }
    }

    fn arm_sync_timer(&self, conn_id: ConnId, wp_id: u8) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SYNC_TIMER).await;
            let _ = tx.send(Event::SyncTimer { conn_id, wp_id }).await;
        });
    }

    /* ---------------- rescans & fan-out ---------------- */

    fn on_dir_changed(&mut self, wp_index: usize, dir: PathBuf) {
        let Some(wp) = self.watchpoints.get_mut(wp_index) else {
            return;
        };
        let dir = dir.to_string_lossy();
        let Some(key) = dir.strip_prefix(wp.path()) else {
            return;
        };
        let key = key.to_string();
        if !key.is_empty() && !wp.valid_key(&key) {
            return;
        }

        let changes = wp.rescan(&key, None);
        if !changes.is_empty() {
            debug!("{}: {} changes under {:?}", wp.path(), changes.len(), key);
            self.fan_out_changes(wp_index, &changes);
        }
    }

    fn unlock_rescan(&mut self, wp_index: usize, key: &str, md4: [u8; 16]) {
        let changes = self.watchpoints[wp_index].rescan(key, Some(&md4));
        self.fan_out_changes(wp_index, &changes);
        let full = format!("{}{}", self.watchpoints[wp_index].path(), key);
        self.soft_locks.unlock(&full);
    }

    /// Deliver change records to every session attached to a watchpoint.
    /// Writes applied under a session's own soft lock carry its token and
    /// are skipped by that session.
    fn fan_out_changes(&mut self, wp_index: usize, changes: &[Change]) {
        let root = self.watchpoints[wp_index].path().to_string();
        let targets: Vec<(ConnId, u8)> = self
            .connections
            .iter()
            .flat_map(|(conn_id, conn)| {
                conn.sessions.iter().enumerate().filter_map(|(index, slot)| {
                    slot.as_ref()
                        .filter(|slot| slot.wp_index == wp_index)
                        .map(|_| (*conn_id, index as u8))
                })
            })
            .collect();

        for (conn_id, wp_id) in targets {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                continue;
            };
            let Some(Some(slot)) = conn.sessions.get_mut(wp_id as usize) else {
                continue;
            };
            let mut fx = Vec::new();
            for change in changes {
                let owner = self.soft_locks.owner(&format!("{root}{}", change.key));
                slot.session
                    .file_changed(&change.key, change.state, owner, &mut fx);
            }
            for effect in fx {
                if matches!(effect, Effect::ArmSyncTimer) {
                    self.arm_sync_timer(conn_id, wp_id);
                }
            }
        }
    }

    /* ---------------- registration & keys ---------------- */

    fn register_watchpoint(&mut self, conn_id: ConnId, wp_id: u8, name: &str) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let slot_index = wp_id as usize;
        if conn.sessions.len() <= slot_index {
            conn.sessions.resize_with(slot_index + 1, || None);
        }
        if conn.sessions[slot_index].is_some() {
            warn!("duplicate registration for slot {wp_id}");
            conn.wire(wp_id).send_raw(MessageType::Reject, &[]);
            return;
        }

        let found = self
            .watchpoints
            .iter()
            .position(|wp| !wp.export_name().is_empty() && wp.export_name() == name);
        match found {
            Some(wp_index) => {
                let token = self.next_token;
                self.next_token += 1;
                conn.sessions[slot_index] = Some(SessionSlot {
                    session: Session::new(token, false, None),
                    wp_index,
                });
                conn.wire(wp_id).send_raw(MessageType::Accept, &[]);
                info!("watchpoint {name} accepted for {}", conn.peer);

                // Replay currently held foreign locks to the newcomer.
                for notice in self.lock_poll.held_for(wp_index) {
                    self.notify_lock_single(conn_id, wp_id, &notice.key, notice.kind);
                }
            }
            None => {
                info!("watchpoint {name} rejected for {}", conn.peer);
                conn.wire(wp_id).send_raw(MessageType::Reject, &[]);
            }
        }
    }

    fn accept_key(&self, key: &str) {
        if !self.config.accept_keys || key.is_empty() {
            return;
        }
        let Some(home) = &self.key_home else {
            return;
        };
        let auth_path = home.join(".ssh/authorized_keys");
        let existing = std::fs::read_to_string(&auth_path).unwrap_or_default();
        if existing.lines().any(|line| line == key) {
            return;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(key);
        content.push('\n');
        if let Err(e) = std::fs::write(&auth_path, content) {
            warn!("cannot record peer key in {}: {}", auth_path.display(), e);
        } else {
            info!("recorded peer key in {}", auth_path.display());
        }
    }

    /* ---------------- advisory locks ---------------- */

    fn peer_lock(&mut self, conn_id: ConnId, wp_index: usize, key: &str, kind: LockKind) {
        let full = format!("{}{}", self.watchpoints[wp_index].path(), key);
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let notify = match kind {
            LockKind::Release => conn.unlock_file(&full).is_some(),
            _ => conn.lock_file(&full, kind, wp_index),
        };
        if notify {
            self.notify_lock_others(conn_id, wp_index, key, kind);
        }
    }

    fn on_lock_poll(&mut self) {
        let watchpoints = &self.watchpoints;
        let mut resolve = |inode: u64, device: u64| -> Option<(usize, String)> {
            watchpoints
                .iter()
                .enumerate()
                .find_map(|(index, wp)| wp.db.find_path(inode, device).map(|key| (index, key)))
        };
        let notices = self.lock_poll.poll(&mut resolve);
        for notice in notices {
            self.notify_lock_all(notice.wp_index, &notice.key, notice.kind);
        }
    }

    fn notify_lock_all(&mut self, wp_index: usize, key: &str, kind: LockKind) {
        self.notify_lock(None, wp_index, key, kind);
    }

    fn notify_lock_others(&mut self, except: ConnId, wp_index: usize, key: &str, kind: LockKind) {
        self.notify_lock(Some(except), wp_index, key, kind);
    }

    fn notify_lock_single(&mut self, conn_id: ConnId, wp_id: u8, key: &str, kind: LockKind) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let mut wire = conn.wire(wp_id);
        let Some(Some(slot)) = conn.sessions.get_mut(wp_id as usize) else {
            return;
        };
        slot.session.filelock_changed(&mut wire, key, kind);
    }

    fn notify_lock(
        &mut self,
        except: Option<ConnId>,
        wp_index: usize,
        key: &str,
        kind: LockKind,
    ) {
        let targets: Vec<(ConnId, u8)> = self
            .connections
            .iter()
            .filter(|(conn_id, _)| Some(**conn_id) != except)
            .flat_map(|(conn_id, conn)| {
                conn.sessions.iter().enumerate().filter_map(|(index, slot)| {
                    slot.as_ref()
                        .filter(|slot| slot.wp_index == wp_index)
                        .map(|_| (*conn_id, index as u8))
                })
            })
            .collect();
        for (conn_id, wp_id) in targets {
            self.notify_lock_single(conn_id, wp_id, key, kind);
        }
    }

    /* ---------------- imports ---------------- */

    fn arm_import_timer(&mut self, wp_index: usize, delay: Duration) {
        let state = &mut self.reconnect[wp_index];
        if state.armed {
            return;
        }
        state.armed = true;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::ImportTimer { wp_index }).await;
        });
    }

    async fn on_import_timer(&mut self, wp_index: usize) {
        self.reconnect[wp_index].armed = false;
        self.reconnect[wp_index].begin_round();

        let imports = self.imports[wp_index].clone();
        while self.reconnect[wp_index].next_import < imports.len() {
            let import = &imports[self.reconnect[wp_index].next_import];
            match self.connect_import(wp_index, import).await {
                ConnectOutcome::Connected => {
                    self.reconnect[wp_index].next_import += 1;
                    return;
                }
                ConnectOutcome::SshStarted => {
                    // The tunnel needs a moment before the dial.
                    self.arm_import_timer(wp_index, SSH_GRACE);
                    return;
                }
                ConnectOutcome::Failed => {
                    self.reconnect[wp_index].next_import += 1;
                }
            }
        }

        self.reconnect[wp_index].next_import = 0;
        let delay = self.reconnect[wp_index].idle_delay();
        info!("retrying imports in {}s", delay.as_secs());
        self.arm_import_timer(wp_index, delay);
    }

    async fn connect_import(&mut self, wp_index: usize, import: &ImportConfig) -> ConnectOutcome {
        let key = import.pool_key();

        // An existing connection to the same peer carries this import too.
        if let Some(conn_id) = self.pool.get(&key).and_then(|entry| entry.conn_id) {
            if self.connections.contains_key(&conn_id) {
                self.register_import(conn_id, wp_index, import);
                return ConnectOutcome::Connected;
            }
            self.pool.remove(&key);
        }

        if import.ssh {
            let tunnel = self.pool.get_mut(&key).and_then(|entry| entry.tunnel.take());
            match tunnel {
                None => match start_tunnel(&self.config, import) {
                    Some(tunnel) => {
                        self.pool.insert(
                            key,
                            PoolEntry {
                                conn_id: None,
                                tunnel: Some(tunnel),
                            },
                        );
                        ConnectOutcome::SshStarted
                    }
                    None => ConnectOutcome::Failed,
                },
                Some(mut tunnel) => {
                    if !tunnel.is_alive() {
                        info!("ssh tunnel for {key} died");
                        self.pool.remove(&key);
                        return ConnectOutcome::Failed;
                    }
                    match dial("127.0.0.1", tunnel.local_port).await {
                        Some(stream) => {
                            let conn_id = self.add_client_connection(stream, key.clone());
                            self.pool.insert(
                                key,
                                PoolEntry {
                                    conn_id: Some(conn_id),
                                    tunnel: Some(tunnel),
                                },
                            );
                            self.register_import(conn_id, wp_index, import);
                            ConnectOutcome::Connected
                        }
                        None => {
                            tunnel.stop().await;
                            self.pool.remove(&key);
                            ConnectOutcome::Failed
                        }
                    }
                }
            }
        } else {
            match dial(&import.server, import.port).await {
                Some(stream) => {
                    let conn_id = self.add_client_connection(stream, key.clone());
                    self.pool.insert(
                        key,
                        PoolEntry {
                            conn_id: Some(conn_id),
                            tunnel: None,
                        },
                    );
                    self.register_import(conn_id, wp_index, import);
                    ConnectOutcome::Connected
                }
                None => ConnectOutcome::Failed,
            }
        }
    }

    fn add_client_connection(&mut self, stream: tokio::net::TcpStream, key: String) -> ConnId {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let conn = Connection::spawn(conn_id, stream, true, Some(key), self.events_tx.clone());
        self.connections.insert(conn_id, conn);
        conn_id
    }

    fn register_import(&mut self, conn_id: ConnId, wp_index: usize, import: &ImportConfig) {
        let translator: Option<IdTranslator> = self.config.translator(&import.translate);
        let token = self.next_token;
        self.next_token += 1;

        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let wp_id = conn.sessions.len() as u8;
        conn.sessions.push(Some(SessionSlot {
            session: Session::new(token, true, translator),
            wp_index,
        }));
        conn.wire(wp_id)
            .send_raw(MessageType::RegisterWatchPoint, import.name.as_bytes());
        info!(
            "registering import {} as slot {} on connection {}",
            import.name, wp_id, conn_id
        );
    }

    /* ---------------- teardown ---------------- */

    async fn teardown(&mut self, conn_id: ConnId) {
        let Some(mut conn) = self.connections.remove(&conn_id) else {
            return;
        };
        info!("connection {} with {} closed", conn_id, conn.peer);
        conn.shutdown();

        // Tear dialogs down top to bottom; released locks rescan their
        // paths so half-applied transfers are re-detected.
        let mut slots = std::mem::take(&mut conn.sessions);
        let mut deferred: Vec<(usize, Vec<Effect>)> = Vec::new();
        let mut client_wps: Vec<usize> = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.session.core.is_client {
                client_wps.push(slot.wp_index);
            }
            let mut wire = conn.wire(index as u8);
            let mut fx = Vec::new();
            {
                let mut ctx = Ctx {
                    wp: &mut self.watchpoints[slot.wp_index],
                    wire: &mut wire,
                    locks: &mut self.soft_locks,
                };
                slot.session.teardown(&mut ctx, &mut fx);
            }
            deferred.push((slot.wp_index, fx));
        }
        for (wp_index, fx) in deferred {
            for effect in fx {
                if let Effect::UnlockRescan { key, md4 } = effect {
                    self.unlock_rescan(wp_index, &key, md4);
                }
            }
        }

        // Peer-held advisory locks die with the connection.
        for (path, wp_index) in conn.drain_locks() {
            let root = self.watchpoints[wp_index].path().to_string();
            if let Some(key) = path.strip_prefix(&root) {
                let key = key.to_string();
                self.notify_lock_all(wp_index, &key, LockKind::Release);
            }
        }

        if let Some(key) = conn.pool_key.take() {
            if let Some(entry) = self.pool.remove(&key) {
                if let Some(tunnel) = entry.tunnel {
                    tunnel.stop().await;
                }
            }
            // Importing side: come back soon.
            for wp_index in client_wps {
                self.arm_import_timer(wp_index, Duration::ZERO);
            }
        }
    }

    pub fn events_sender(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }
}

enum ConnectOutcome {
    Failed,
    SshStarted,
    Connected,
}
