//! The protocol dialogs, one pushdown automaton per session.
//!
//! Each dialog is a tagged variant holding its own local state; dispatch
//! is an explicit match and ending a dialog is a value returned from the
//! step, not an upcall. A popped dialog wakes the one beneath it through
//! `pop_up`, which is how a parent learns its sub-exchange finished.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};
use treesync_delta::{
    DeltaJob, Drive, PatchJob, SignatureIndex, SignatureJob, SignatureParser,
};
use treesync_index::{snapshot, ModLog};
use treesync_proto::{action, FileState, MessageType, RecordWriter, MAX_COPY_SIZE};

use crate::reconcile::reconcile;
use crate::session::{text, Ctx, Effect, SessionCore};

/// What a dialog step decided about the stack.
pub enum Flow {
    Keep,
    End,
    Push(Box<Dialog>),
    PushFeed(Box<Dialog>, MessageType, Vec<u8>),
}

/// How the driver invokes the top dialog.
pub enum Call {
    Msg(MessageType, Vec<u8>),
    PopUp,
}

pub enum Dialog {
    FullSyncClient(FullSyncClient),
    FullSyncServer(FullSyncServer),
    SyncSend(SyncSend),
    SyncReceive(SyncReceive),
    SendLog(SendLog),
    RsyncSend(RsyncSend),
    RsyncReceive(RsyncReceive),
    Link(LinkDialog),
    Stacked(Vec<Dialog>),
}

impl Dialog {
    pub fn full_sync_client() -> Dialog {
        Dialog::FullSyncClient(FullSyncClient {
            mode: FscMode::Start,
            client_file: String::new(),
            server_file: String::new(),
            server_log: ModLog::new(),
            require_resync: false,
        })
    }

    pub fn full_sync_server() -> Dialog {
        Dialog::FullSyncServer(FullSyncServer { state_file: None })
    }

    pub fn sync_send(as_client: bool) -> Dialog {
        Dialog::SyncSend(SyncSend {
            as_client,
            mode: SsdMode::Start,
        })
    }

    pub fn sync_receive(as_client: bool) -> Dialog {
        Dialog::SyncReceive(SyncReceive {
            as_client,
            log: ModLog::new(),
            locked: false,
        })
    }

    pub fn send_log(msg_type: MessageType, source: LogSource) -> Dialog {
        Dialog::SendLog(SendLog {
            msg_type,
            source,
            cursor: None,
            writer: RecordWriter::new(Vec::new()),
        })
    }

    pub fn rsync_send(key: String, state: FileState) -> Dialog {
        Dialog::RsyncSend(RsyncSend {
            key,
            state,
            sig: None,
            patch: None,
            tmp: None,
        })
    }

    pub fn rsync_receive() -> Dialog {
        Dialog::RsyncReceive(RsyncReceive {
            key: String::new(),
            parser: None,
            delta: None,
        })
    }

    pub fn link(key: String, state: FileState) -> Dialog {
        Dialog::Link(LinkDialog { key, state })
    }

    pub fn start(&mut self, core: &mut SessionCore, ctx: &mut Ctx, _fx: &mut Vec<Effect>) -> Flow {
        match self {
            Dialog::FullSyncClient(d) => d.start(core, ctx),
            Dialog::FullSyncServer(_) => Flow::Keep,
            Dialog::SyncSend(d) => d.start(core, ctx),
            Dialog::SyncReceive(_) => {
                debug!("sync receive start");
                Flow::Keep
            }
            Dialog::SendLog(d) => d.pump(core, ctx),
            Dialog::RsyncSend(d) => d.start(ctx),
            Dialog::RsyncReceive(_) => Flow::Keep,
            Dialog::Link(d) => {
                ctx.wire.send(MessageType::GetLink, d.key.as_bytes());
                Flow::Keep
            }
            Dialog::Stacked(subs) => next_stacked(subs),
        }
    }

    pub fn on_message(
        &mut self,
        core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) -> Flow {
        match self {
            Dialog::FullSyncClient(d) => d.on_message(core, ctx, msg, payload, fx),
            Dialog::FullSyncServer(d) => d.on_message(core, ctx, msg, payload, fx),
            Dialog::SyncSend(d) => d.on_message(core, ctx, msg, payload, fx),
            Dialog::SyncReceive(d) => d.on_message(core, ctx, msg, payload, fx),
            Dialog::SendLog(d) => match msg {
                MessageType::WriteAvail => d.pump(core, ctx),
                other => default_reject(ctx, "SendLog", other),
            },
            Dialog::RsyncSend(d) => d.on_message(core, ctx, msg, payload),
            Dialog::RsyncReceive(d) => d.on_message(ctx, msg, payload),
            Dialog::Link(d) => d.on_message(core, ctx, msg, payload),
            Dialog::Stacked(_) => default_reject(ctx, "Stacked", msg),
        }
    }

    pub fn pop_up(&mut self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) -> Flow {
        match self {
            Dialog::FullSyncClient(d) => d.pop_up(core, ctx, fx),
            Dialog::SyncSend(d) => d.pop_up(ctx),
            Dialog::SyncReceive(d) => d.finish(core, ctx, fx),
            Dialog::Stacked(subs) => next_stacked(subs),
            _ => Flow::Keep,
        }
    }

    /// Cleanup on pop or session teardown: scratch files and outstanding
    /// soft locks must not survive the dialog.
    pub fn teardown(self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        match self {
            Dialog::FullSyncServer(d) => {
                if let Some(key) = d.state_file {
                    let _ = fs::remove_file(ctx.wp.full_path(&key));
                }
            }
            Dialog::FullSyncClient(d) => {
                if !d.client_file.is_empty() {
                    let _ = fs::remove_file(ctx.wp.full_path(&d.client_file));
                }
                if !d.server_file.is_empty() {
                    let _ = fs::remove_file(ctx.wp.full_path(&d.server_file));
                }
            }
            Dialog::SyncReceive(mut d) => d.release_locks(ctx, fx),
            Dialog::RsyncSend(d) => {
                if let Some(tmp) = d.tmp {
                    let _ = fs::remove_file(tmp);
                }
            }
            Dialog::Stacked(subs) => {
                for sub in subs {
                    sub.teardown(core, ctx, fx);
                }
            }
            _ => {}
        }
    }
}

/// The base behavior: an out-of-phase frame is answered with `Reject`
/// and dropped; only the write-available tick is silently ignored.
fn default_reject(ctx: &mut Ctx, who: &str, msg: MessageType) -> Flow {
    if msg != MessageType::WriteAvail {
        debug!("{who} did not accept {}", msg.name());
        ctx.wire.send(MessageType::Reject, &[]);
    }
    Flow::Keep
}

fn next_stacked(subs: &mut Vec<Dialog>) -> Flow {
    match subs.pop() {
        Some(next) => Flow::Push(Box::new(next)),
        None => Flow::End,
    }
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn encode_announce(name: &str, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len() + 8);
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

fn decode_announce(payload: &[u8]) -> Option<(String, u64)> {
    if payload.len() < 12 {
        return None;
    }
    let name_len = u32::from_le_bytes(payload[..4].try_into().ok()?) as usize;
    let rest = payload.get(4..)?;
    if rest.len() != name_len + 8 {
        return None;
    }
    let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
    let size = u64::from_le_bytes(rest[name_len..].try_into().ok()?);
    Some((name, size))
}

/* ------------------------------------------------------------------ */

#[derive(Debug, PartialEq)]
enum FscMode {
    Start,
    WaitForSyncData,
    WaitForSendLogComplete,
}

/// Client side of the initial full sync: fetch the server snapshot over
/// rsync, reconcile three ways, ship the server its share of the diff.
pub struct FullSyncClient {
    mode: FscMode,
    client_file: String,
    server_file: String,
    server_log: ModLog,
    require_resync: bool,
}

impl FullSyncClient {
    fn start(&mut self, _core: &mut SessionCore, ctx: &mut Ctx) -> Flow {
        info!("full sync started");
        ctx.wire.send(MessageType::FullSyncStart, &[]);
        match ctx.wp.create_state_file(true) {
            Ok((key, _)) => self.client_file = key,
            Err(e) => error!("cannot snapshot local state: {e}"),
        }
        Flow::Keep
    }

    fn on_message(
        &mut self,
        _core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) -> Flow {
        match msg {
            MessageType::FullSyncState => {
                let Some((name, size)) = decode_announce(payload) else {
                    warn!("malformed state announcement");
                    ctx.wire.send(MessageType::Reject, &[]);
                    return Flow::Keep;
                };
                debug!("server snapshot {name} ({size} bytes)");
                self.mode = FscMode::WaitForSyncData;
                self.server_file = name;

                // Seed the transfer target with our own snapshot so the
                // rsync exchange only moves the difference.
                let src = ctx.wp.full_path(&self.client_file);
                let dst = ctx.wp.full_path(&self.server_file);
                if let Err(e) = fs::copy(&src, &dst) {
                    warn!("cannot seed snapshot transfer: {e}");
                }

                let state = FileState {
                    mode: 0o666,
                    mtime: epoch_now(),
                    ..FileState::default()
                };
                Flow::Push(Box::new(Dialog::rsync_send(self.server_file.clone(), state)))
            }
            MessageType::Reject => {
                error!("server reported an error during full sync");
                fx.push(Effect::Disconnect);
                Flow::End
            }
            other => default_reject(ctx, "FullSync(client)", other),
        }
    }

    fn pop_up(&mut self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) -> Flow {
        if self.mode == FscMode::WaitForSyncData {
            self.compare_state(core, ctx, fx);

            let _ = fs::remove_file(ctx.wp.full_path(&self.client_file));
            let _ = fs::remove_file(ctx.wp.full_path(&self.server_file));
            self.client_file.clear();
            self.server_file.clear();

            if !self.server_log.is_empty() {
                self.mode = FscMode::WaitForSendLogComplete;
                let log = std::mem::take(&mut self.server_log);
                return Flow::Push(Box::new(Dialog::send_log(
                    MessageType::FullSyncLog,
                    LogSource::Owned(log),
                )));
            }
        }

        if self.mode == FscMode::WaitForSendLogComplete {
            ctx.wire.send(MessageType::FullSyncLogEnd, &[]);
        }

        ctx.wire.send(MessageType::FullSyncComplete, &[]);
        if self.require_resync {
            core.require_sync(fx);
        }
        info!("full sync complete");
        Flow::End
    }

    fn compare_state(&mut self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        let client = match snapshot::load_from_file(&ctx.wp.full_path(&self.client_file)) {
            Ok(map) => map,
            Err(e) => {
                warn!("cannot read local snapshot: {e}");
                return;
            }
        };
        let server = match snapshot::load_from_file(&ctx.wp.full_path(&self.server_file)) {
            Ok(map) => map,
            Err(e) => {
                warn!("cannot read transferred snapshot: {e}");
                return;
            }
        };
        let witness = match snapshot::load_from_file(&ctx.wp.last_sync_state_path()) {
            Ok(map) => map,
            Err(e) => {
                warn!("cannot read last-sync snapshot: {e}");
                return;
            }
        };

        let server = server.into_iter().map(|(key, mut state)| {
            core.translate_received(&mut state);
            (key, state)
        });

        let mut backups = Vec::new();
        let outcome = reconcile(client, server, witness, &mut |key: &str| {
            backups.push(key.to_string())
        });
        for key in backups {
            ctx.wp.backup(&key);
        }

        self.server_log = outcome.to_server;
        for (key, state) in outcome.to_client {
            core.add_to_log(&key, state, None, false, fx);
            self.require_resync = true;
        }
    }
}

/* ------------------------------------------------------------------ */

/// Server side of the full sync: publish a snapshot, serve it over
/// rsync, absorb the client's reconciled log.
pub struct FullSyncServer {
    state_file: Option<String>,
}

impl FullSyncServer {
    fn on_message(
        &mut self,
        core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) -> Flow {
        match msg {
            MessageType::FullSyncStart => {
                match ctx.wp.create_state_file(true) {
                    Ok((key, size)) => {
                        ctx.wire
                            .send(MessageType::FullSyncState, &encode_announce(&key, size));
                        self.state_file = Some(key);
                    }
                    Err(e) => {
                        error!("cannot snapshot state for full sync: {e}");
                        ctx.wire.send(MessageType::Reject, &[]);
                    }
                }
                Flow::Keep
            }
            MessageType::FullSyncLog => {
                core.receive_into_write_log(ctx.wp, payload);
                Flow::Keep
            }
            MessageType::FullSyncLogEnd => {
                core.require_sync(fx);
                Flow::Keep
            }
            MessageType::FullSyncComplete => Flow::End,
            MessageType::RsyncStart => Flow::PushFeed(
                Box::new(Dialog::rsync_receive()),
                msg,
                payload.to_vec(),
            ),
            other => default_reject(ctx, "FullSync(server)", other),
        }
    }
}

/* ------------------------------------------------------------------ */

#[derive(Debug, PartialEq)]
enum SsdMode {
    Start,
    SendingSyncLog,
    WaitForComplete,
    Receive,
}

/// Push the frozen send log to the peer and wait for completion.
pub struct SyncSend {
    as_client: bool,
    mode: SsdMode,
}

impl SyncSend {
    fn start(&mut self, core: &mut SessionCore, ctx: &mut Ctx) -> Flow {
        debug!("sync send started");
        ctx.wire.send(MessageType::SyncStart, &[]);
        core.set_pending_sync(false);
        Flow::Keep
    }

    fn on_message(
        &mut self,
        core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) -> Flow {
        match msg {
            MessageType::Reject => {
                // Peer cannot take the round now; fold the log back.
                if self.mode == SsdMode::WaitForComplete {
                    core.undo_sync(fx);
                    return Flow::End;
                }
                Flow::Keep
            }
            MessageType::SyncStart => {
                if self.mode == SsdMode::Start && self.as_client {
                    // Simultaneous rounds: the client yields first.
                    self.mode = SsdMode::Receive;
                    return Flow::PushFeed(
                        Box::new(Dialog::sync_receive(true)),
                        msg,
                        payload.to_vec(),
                    );
                }
                default_reject(ctx, "SyncSend", msg)
            }
            MessageType::SyncStartOk => {
                self.mode = SsdMode::SendingSyncLog;
                Flow::Push(Box::new(Dialog::send_log(
                    MessageType::SyncLogBlock,
                    LogSource::SessionSend,
                )))
            }
            MessageType::SyncComplete => {
                core.send_log_mut().clear();
                core.save_state(ctx.wp);
                Flow::End
            }
            MessageType::RsyncStart => Flow::PushFeed(
                Box::new(Dialog::rsync_receive()),
                msg,
                payload.to_vec(),
            ),
            MessageType::Backup => {
                ctx.wp.backup(&text(payload));
                Flow::Keep
            }
            MessageType::GetLink => {
                let target = ctx.wp.read_link(&text(payload));
                ctx.wire.send(MessageType::LinkDest, target.as_bytes());
                Flow::Keep
            }
            other => default_reject(ctx, "SyncSend", other),
        }
    }

    fn pop_up(&mut self, ctx: &mut Ctx) -> Flow {
        match self.mode {
            SsdMode::SendingSyncLog => {
                ctx.wire.send(MessageType::SyncLogEnd, &[]);
                self.mode = SsdMode::WaitForComplete;
                Flow::Keep
            }
            SsdMode::Receive => {
                // Our turn again after yielding to the peer's round.
                self.mode = SsdMode::Start;
                ctx.wire.send(MessageType::SyncStart, &[]);
                Flow::Keep
            }
            _ => Flow::Keep,
        }
    }
}

/* ------------------------------------------------------------------ */

/// Receive a peer's log blocks, resolve collisions against our own
/// pending log, then apply record by record.
pub struct SyncReceive {
    as_client: bool,
    log: ModLog,
    locked: bool,
}

impl SyncReceive {
    fn on_message(
        &mut self,
        core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) -> Flow {
        match msg {
            MessageType::SyncStart => {
                ctx.wire.send(MessageType::SyncStartOk, &[]);
                Flow::Keep
            }
            MessageType::SyncLogBlock => {
                core.receive_log(ctx.wp, payload, &mut self.log);
                Flow::Keep
            }
            MessageType::SyncLogEnd => self.do_sync(core, ctx, fx),
            MessageType::Reject => Flow::Keep,
            other => default_reject(ctx, "SyncReceive", other),
        }
    }

    fn do_sync(&mut self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) -> Flow {
        let records: Vec<(String, FileState)> =
            self.log.iter().map(|(k, s)| (k.clone(), *s)).collect();

        // Claim every path first; an overlap with another connection's
        // round rejects the whole block and the peer retries.
        let mut acquired: Vec<(String, [u8; 16])> = Vec::new();
        for (key, state) in &records {
            let full = format!("{}{}", ctx.wp.path(), key);
            if !ctx.locks.lock(&full, core.token) {
                info!("sync rejected, {key} is being applied elsewhere");
                for (key, md4) in acquired {
                    fx.push(Effect::UnlockRescan { key, md4 });
                }
                self.log.clear();
                ctx.wire.send(MessageType::Reject, &[]);
                return Flow::End;
            }
            acquired.push((key.clone(), state.md4));
        }
        self.locked = true;

        let mut subs: Vec<Dialog> = Vec::new();
        for (key, mut state) in records {
            if !self.check_backup(&key, &mut state, core, ctx) {
                continue;
            }

            if !core.is_client {
                let (writable, local) = ctx.wp.is_writeable(&key);
                if !writable {
                    info!("denied: {key} is read only here");
                    let mut inverse = local;
                    inverse.action = match state.action {
                        action::REMOVED => {
                            if local.is_symlink() {
                                action::NEWLINK
                            } else {
                                action::CREATED
                            }
                        }
                        action::NEWLINK | action::CREATED => action::REMOVED,
                        action::MKDIRED => action::RMDIRED,
                        action::RMDIRED => action::MKDIRED,
                        other => other,
                    };
                    core.add_to_log(&key, inverse, None, true, fx);
                    continue;
                }
            }

            match state.action {
                action::REMOVED => {
                    info!("sync remove {key}");
                    ctx.wp.remove(&key);
                }
                action::NEWLINK => {
                    info!("sync link {key}");
                    subs.push(Dialog::link(key.clone(), state));
                }
                action::NEWACCESS => {
                    info!("sync access {key}");
                    ctx.wp.change_access(&key, &state);
                }
                action::CREATED | action::CHANGED => {
                    info!("sync content {key}");
                    subs.push(Dialog::rsync_send(key.clone(), state));
                }
                action::MKDIRED => {
                    info!("sync mkdir {key}");
                    ctx.wp.remove(&key);
                    ctx.wp.mkdir(&key, &state);
                }
                action::RMDIRED => {
                    info!("sync rmdir {key}");
                    ctx.wp.remove(&key);
                }
                action::NONE => {}
                other => warn!("cannot apply action {other:#x} for {key}"),
            }
        }

        if subs.is_empty() {
            return self.finish(core, ctx, fx);
        }
        subs.reverse();
        Flow::Push(Box::new(Dialog::Stacked(subs)))
    }

    /// Both peers changed the same path at once; decide who backs up.
    fn check_backup(
        &self,
        key: &str,
        state: &mut FileState,
        core: &SessionCore,
        ctx: &mut Ctx,
    ) -> bool {
        let Some(ours) = core.find_in_log(key) else {
            return true;
        };

        match ours.action {
            action::NEWACCESS => {
                // Only our access bits changed; keep them over the peer's.
                state.uid = ours.uid;
                state.gid = ours.gid;
                state.mode = ours.mode;
                state.mtime = ours.mtime;
                state.ctime = ours.ctime;
                true
            }
            action::REMOVED | action::RMDIRED => {
                if state.action != ours.action {
                    ctx.wire.send(MessageType::Backup, key.as_bytes());
                }
                false
            }
            action::CREATED | action::CHANGED => {
                if state.action == action::REMOVED {
                    ctx.wp.backup(key);
                    return true;
                }
                if ours.md4 != state.md4 {
                    ctx.wire.send(MessageType::Backup, key.as_bytes());
                    return false;
                }
                state.action = action::NEWACCESS;
                true
            }
            action::MKDIRED => {
                if state.action != action::RMDIRED {
                    ctx.wire.send(MessageType::Backup, key.as_bytes());
                }
                false
            }
            _ => true,
        }
    }

    /// All sub-dialogs finished: release locks (triggering the rescans
    /// that attribute our writes), acknowledge, persist.
    fn finish(&mut self, core: &mut SessionCore, ctx: &mut Ctx, fx: &mut Vec<Effect>) -> Flow {
        self.release_locks(ctx, fx);
        ctx.wire.send(MessageType::SyncComplete, &[]);
        core.save_state(ctx.wp);
        Flow::End
    }

    fn release_locks(&mut self, _ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        for (key, state) in self.log.iter() {
            fx.push(Effect::UnlockRescan {
                key: key.clone(),
                md4: state.md4,
            });
        }
        self.log.clear();
        self.locked = false;
    }
}

/* ------------------------------------------------------------------ */

pub enum LogSource {
    /// The session's frozen send log.
    SessionSend,
    /// A log owned by the pushing dialog (full-sync reconciliation).
    Owned(ModLog),
}

/// Walk a log, serialize records into bounded blocks, yield to the
/// transport between blocks.
pub struct SendLog {
    msg_type: MessageType,
    source: LogSource,
    cursor: Option<String>,
    writer: RecordWriter<Vec<u8>>,
}

impl SendLog {
    fn pump(&mut self, core: &mut SessionCore, ctx: &mut Ctx) -> Flow {
        loop {
            let next = {
                let log = match &self.source {
                    LogSource::SessionSend => core.send_log(),
                    LogSource::Owned(log) => log,
                };
                next_after(log, self.cursor.as_deref())
            };

            let Some((key, mut state)) = next else {
                // The final, possibly partial block always goes out.
                let block = self.writer.take_block();
                ctx.wire.send(self.msg_type, &block);
                return Flow::End;
            };

            core.translate_send(&mut state);
            let _ = self.writer.write(&key, &state);

            if state.action == action::RMDIRED {
                // The record stands for the subtree; drop the children.
                match &mut self.source {
                    LogSource::SessionSend => core.send_log_mut().erase_children(&key),
                    LogSource::Owned(log) => log.erase_children(&key),
                }
            }
            self.cursor = Some(key);

            if self.writer.buffered_len() >= MAX_COPY_SIZE {
                let block = self.writer.take_block();
                ctx.wire.send(self.msg_type, &block);
                if ctx.wire.write_bytes_pending() {
                    return Flow::Keep;
                }
            }
        }
    }
}

fn next_after(log: &ModLog, cursor: Option<&str>) -> Option<(String, FileState)> {
    log.next_after(cursor)
        .map(|(key, state)| (key.clone(), *state))
}

/* ------------------------------------------------------------------ */

/// Protocol role: the side with the stale file. Streams signatures of
/// its current copy, then patches the incoming delta into place.
pub struct RsyncSend {
    key: String,
    state: FileState,
    sig: Option<SignatureJob>,
    patch: Option<PatchJob>,
    tmp: Option<PathBuf>,
}

impl RsyncSend {
    fn start(&mut self, ctx: &mut Ctx) -> Flow {
        let full = ctx.wp.full_path(&self.key);
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(_) => {
                // First transfer of a new file: sign an empty base.
                let _ = OpenOptions::new().create(true).append(true).open(&full);
                match File::open(&full) {
                    Ok(file) => file,
                    Err(e) => {
                        error!("cannot open {} for transfer: {}", full.display(), e);
                        return Flow::End;
                    }
                }
            }
        };
        self.sig = Some(SignatureJob::new(file));
        ctx.wire.send(MessageType::RsyncStart, self.key.as_bytes());
        self.pump_sigs(ctx)
    }

    fn on_message(
        &mut self,
        _core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
    ) -> Flow {
        match msg {
            MessageType::RsyncAbort => {
                info!("transfer of {} aborted by peer", self.key);
                Flow::End
            }
            MessageType::RsyncDeltaBlock => self.patch_block(ctx, payload, false),
            MessageType::RsyncDeltaEnd => self.patch_block(ctx, payload, true),
            MessageType::WriteAvail => {
                if self.sig.is_some() {
                    self.pump_sigs(ctx)
                } else {
                    Flow::Keep
                }
            }
            MessageType::Reject => Flow::Keep,
            other => default_reject(ctx, "RsyncSend", other),
        }
    }

    fn pump_sigs(&mut self, ctx: &mut Ctx) -> Flow {
        let Some(job) = self.sig.as_mut() else {
            return Flow::Keep;
        };
        loop {
            match job.drive() {
                Ok(Drive::Block(block)) => {
                    ctx.wire.send(MessageType::RsyncSigBlock, &block);
                    if ctx.wire.write_bytes_pending() {
                        return Flow::Keep;
                    }
                }
                Ok(Drive::Done) => {
                    ctx.wire.send(MessageType::RsyncSigEnd, &[]);
                    self.sig = None;
                    return Flow::Keep;
                }
                Err(e) => {
                    error!("signature of {} failed: {}", self.key, e);
                    ctx.wire.send(MessageType::RsyncAbort, &[]);
                    self.sig = None;
                    return Flow::End;
                }
            }
        }
    }

    fn patch_block(&mut self, ctx: &mut Ctx, payload: &[u8], end: bool) -> Flow {
        if self.patch.is_none() {
            let full = ctx.wp.full_path(&self.key);
            let base = match File::open(&full) {
                Ok(file) => file,
                Err(e) => {
                    error!("cannot open patch base {}: {}", full.display(), e);
                    return Flow::End;
                }
            };
            let tmp = ctx
                .wp
                .tmp_dir()
                .join(format!("{}trans", file_name_of(&self.key)));
            let out = match File::create(&tmp) {
                Ok(file) => file,
                Err(e) => {
                    error!("cannot create {}: {}", tmp.display(), e);
                    return Flow::End;
                }
            };
            self.patch = Some(PatchJob::new(base, out));
            self.tmp = Some(tmp);
        }

        if !payload.is_empty() {
            if let Err(e) = self.patch.as_mut().expect("patch job").feed(payload) {
                error!("patching {} failed: {}", self.key, e);
                return Flow::End;
            }
        }

        if !end {
            return Flow::Keep;
        }

        let job = self.patch.take().expect("patch job");
        if let Err(e) = job.finish() {
            error!("patching {} failed: {}", self.key, e);
            return Flow::End;
        }

        let tmp = self.tmp.take().expect("tmp path");
        let full = ctx.wp.full_path(&self.key);
        ctx.wp.remove(&self.key);
        if let Err(e) = fs::rename(&tmp, &full) {
            error!("cannot move {} into place: {}", tmp.display(), e);
            return Flow::End;
        }
        ctx.wp.change_access(&self.key, &self.state);
        info!("rsynched {}", full.display());
        Flow::End
    }
}

/* ------------------------------------------------------------------ */

/// Protocol role: the side with the fresh file. Indexes the peer's
/// signatures, then streams the delta of its authoritative copy.
pub struct RsyncReceive {
    key: String,
    parser: Option<SignatureParser>,
    delta: Option<DeltaJob>,
}

impl RsyncReceive {
    fn on_message(&mut self, ctx: &mut Ctx, msg: MessageType, payload: &[u8]) -> Flow {
        match msg {
            MessageType::RsyncStart => {
                self.key = text(payload);
                self.parser = Some(SignatureParser::new());
                Flow::Keep
            }
            MessageType::RsyncAbort => {
                info!("transfer of {} aborted by peer", self.key);
                Flow::End
            }
            MessageType::RsyncSigBlock => {
                if let Some(parser) = self.parser.as_mut() {
                    if let Err(e) = parser.feed(payload) {
                        // Keep draining blocks; the abort goes out once
                        // the peer finishes the stream.
                        warn!("signature stream for {} is broken: {}", self.key, e);
                        self.parser = None;
                    }
                }
                Flow::Keep
            }
            MessageType::RsyncSigEnd => self.begin_delta(ctx),
            MessageType::WriteAvail => {
                if self.delta.is_some() {
                    self.pump_delta(ctx)
                } else {
                    Flow::Keep
                }
            }
            MessageType::Reject => Flow::Keep,
            other => default_reject(ctx, "RsyncReceive", other),
        }
    }

    fn begin_delta(&mut self, ctx: &mut Ctx) -> Flow {
        let Some(parser) = self.parser.take() else {
            ctx.wire.send(MessageType::RsyncAbort, &[]);
            return Flow::End;
        };
        let signature = match parser.finish() {
            Ok(signature) => signature,
            Err(e) => {
                warn!("signature of {} unusable: {}", self.key, e);
                ctx.wire.send(MessageType::RsyncAbort, &[]);
                return Flow::End;
            }
        };

        let index = SignatureIndex::build(&signature);
        let full = ctx.wp.full_path(&self.key);
        let fresh = match File::open(&full) {
            Ok(file) => file,
            Err(e) => {
                error!("cannot open {} for delta: {}", full.display(), e);
                ctx.wire.send(MessageType::RsyncAbort, &[]);
                return Flow::End;
            }
        };
        match DeltaJob::new(fresh, index) {
            Ok(job) => {
                self.delta = Some(job);
                self.pump_delta(ctx)
            }
            Err(e) => {
                error!("cannot start delta for {}: {}", self.key, e);
                ctx.wire.send(MessageType::RsyncAbort, &[]);
                Flow::End
            }
        }
    }

    fn pump_delta(&mut self, ctx: &mut Ctx) -> Flow {
        let Some(job) = self.delta.as_mut() else {
            return Flow::Keep;
        };
        loop {
            match job.drive() {
                Ok(Drive::Block(block)) => {
                    ctx.wire.send(MessageType::RsyncDeltaBlock, &block);
                    if ctx.wire.write_bytes_pending() {
                        return Flow::Keep;
                    }
                }
                Ok(Drive::Done) => {
                    ctx.wire.send(MessageType::RsyncDeltaEnd, &[]);
                    return Flow::End;
                }
                Err(e) => {
                    error!("delta of {} failed: {}", self.key, e);
                    ctx.wire.send(MessageType::RsyncAbort, &[]);
                    return Flow::End;
                }
            }
        }
    }
}

/* ------------------------------------------------------------------ */

/// Ask the peer for a symlink target and plant the link.
pub struct LinkDialog {
    key: String,
    state: FileState,
}

impl LinkDialog {
    fn on_message(
        &mut self,
        _core: &mut SessionCore,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
    ) -> Flow {
        match msg {
            MessageType::LinkDest => {
                let target = text(payload);
                ctx.wp.make_link(&self.key, &target);
                ctx.wp.change_access(&self.key, &self.state);
                Flow::End
            }
            MessageType::Reject => Flow::Keep,
            other => default_reject(ctx, "Link", other),
        }
    }
}
