//! Per-(watchpoint, connection) protocol state.
//!
//! A session owns two alternating modification logs and a stack of
//! dialogs. Local changes land in the write log; `start_sync` swaps the
//! logs and pushes a send dialog over the now-frozen send log. Incoming
//! frames go to the top dialog, or open a new top-level dialog when the
//! stack is empty.

use tracing::{debug, info, warn};
use treesync_index::ModLog;
use treesync_proto::{FileState, MessageType, RecordReader};

use crate::dialog::{Call, Dialog, Flow};
use crate::locks::{LockToken, SoftLocks};
use crate::translator::IdTranslator;
use crate::watchpoint::WatchPoint;
use crate::wire::Wire;
use crate::LockKind;

/// Borrowed context a session step runs against.
pub struct Ctx<'a> {
    pub wp: &'a mut WatchPoint,
    pub wire: &'a mut dyn Wire,
    pub locks: &'a mut SoftLocks,
}

/// Deferred side effects, applied by the owning loop after the session
/// borrow ends.
#[derive(Debug)]
pub enum Effect {
    /// Arm this session's 1-second sync timer.
    ArmSyncTimer,
    /// Rescan `key` with the fingerprint its soft lock promised, fan the
    /// resulting changes out to every attached session, then release the
    /// lock.
    UnlockRescan { key: String, md4: [u8; 16] },
    /// Peer asked for an advisory lock operation on `key`.
    FileLock { key: String, kind: LockKind },
    /// Tear the connection down.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    Start,
    FullSynched,
}

/// Session state visible to dialogs.
pub struct SessionCore {
    pub token: LockToken,
    pub is_client: bool,
    translator: Option<IdTranslator>,
    pub mode: Mode,
    logs: [ModLog; 2],
    write_idx: usize,
    pending_sync: bool,
    pub timer_armed: bool,
}

impl SessionCore {
    pub fn write_log(&self) -> &ModLog {
        &self.logs[self.write_idx]
    }

    pub fn write_log_mut(&mut self) -> &mut ModLog {
        &mut self.logs[self.write_idx]
    }

    pub fn send_log(&self) -> &ModLog {
        &self.logs[1 - self.write_idx]
    }

    pub fn send_log_mut(&mut self) -> &mut ModLog {
        &mut self.logs[1 - self.write_idx]
    }

    pub fn set_pending_sync(&mut self, pending: bool) {
        self.pending_sync = pending;
    }

    /// Record a change for the peer. Writes attributed to this session's
    /// own soft locks are echoes of what the peer just sent and are
    /// dropped.
    pub fn add_to_log(
        &mut self,
        key: &str,
        state: FileState,
        lock_owner: Option<LockToken>,
        do_sync: bool,
        fx: &mut Vec<Effect>,
    ) {
        if lock_owner == Some(self.token) {
            return;
        }
        self.write_log_mut().insert(key, state);
        if do_sync {
            self.require_sync(fx);
        }
    }

    /// Look a key up in the send log first, then the write log; used to
    /// detect that both peers touched the same path at once.
    pub fn find_in_log(&self, key: &str) -> Option<FileState> {
        self.send_log()
            .get(key)
            .or_else(|| self.write_log().get(key))
            .copied()
    }

    pub fn require_sync(&mut self, fx: &mut Vec<Effect>) {
        if !self.timer_armed {
            self.timer_armed = true;
            fx.push(Effect::ArmSyncTimer);
        }
    }

    /// The peer refused the sync round: fold the unsent records back into
    /// the write log and try again later.
    pub fn undo_sync(&mut self, fx: &mut Vec<Effect>) {
        let send = std::mem::take(self.send_log_mut());
        self.write_log_mut().merge_from(&send);
        self.require_sync(fx);
    }

    pub fn translate_received(&self, state: &mut FileState) {
        if let Some(translator) = &self.translator {
            state.uid = translator.client_uid(state.uid);
            state.gid = translator.client_gid(state.gid);
        }
    }

    pub fn translate_send(&self, state: &mut FileState) {
        if let Some(translator) = &self.translator {
            state.uid = translator.server_uid(state.uid);
            state.gid = translator.server_gid(state.gid);
        }
    }

    /// Persist the last-sync snapshot. Only the importing side keeps one;
    /// reconciliation always runs there.
    pub fn save_state(&self, wp: &mut WatchPoint) {
        if self.is_client && self.mode >= Mode::FullSynched {
            if let Err(e) = wp.create_state_file(false) {
                warn!("could not persist last-sync state: {e}");
            }
        }
    }

    /// Decode one serialized log block into `log`, dropping records the
    /// policy rejects and translating ownership into our id space.
    pub fn receive_log(&self, wp: &WatchPoint, payload: &[u8], log: &mut ModLog) {
        let mut reader = RecordReader::new(payload);
        loop {
            match reader.read() {
                Ok(Some((key, mut state))) => {
                    if !wp.valid_key(&key) {
                        info!("dropping invalid path {key} from peer log");
                        continue;
                    }
                    self.translate_received(&mut state);
                    log.insert(&key, state);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("malformed log block: {e}");
                    break;
                }
            }
        }
    }

    pub fn receive_into_write_log(&mut self, wp: &WatchPoint, payload: &[u8]) {
        let mut log = std::mem::take(self.write_log_mut());
        self.receive_log(wp, payload, &mut log);
        *self.write_log_mut() = log;
    }
}

pub struct Session {
    pub core: SessionCore,
    stack: Vec<Dialog>,
}

enum Op {
    Start {
        dialog: Dialog,
        feed: Option<(MessageType, Vec<u8>)>,
    },
    Deliver(Call),
}

impl Session {
    pub fn new(token: LockToken, is_client: bool, translator: Option<IdTranslator>) -> Self {
        Session {
            core: SessionCore {
                token,
                is_client,
                translator,
                mode: Mode::Start,
                logs: [ModLog::new(), ModLog::new()],
                write_idx: 0,
                pending_sync: false,
                timer_armed: false,
            },
            stack: Vec::new(),
        }
    }

    pub fn has_dialogs(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Route one frame. Lock opcodes are connection business and surface
    /// as effects; everything else feeds the dialog stack.
    pub fn on_frame(
        &mut self,
        ctx: &mut Ctx,
        msg: MessageType,
        payload: &[u8],
        fx: &mut Vec<Effect>,
    ) {
        let kind = match msg {
            MessageType::CreateWriteLock => Some(LockKind::Write),
            MessageType::CreateReadLock => Some(LockKind::Read),
            MessageType::ReleaseLock => Some(LockKind::Release),
            _ => None,
        };
        if let Some(kind) = kind {
            fx.push(Effect::FileLock {
                key: text(payload),
                kind,
            });
            return;
        }

        if self.stack.is_empty() {
            match msg {
                MessageType::FullSyncStart => {
                    self.core.mode = Mode::FullSynched;
                    self.run(
                        Op::Start {
                            dialog: Dialog::full_sync_server(),
                            feed: Some((msg, payload.to_vec())),
                        },
                        ctx,
                        fx,
                    );
                }
                MessageType::SyncStart => {
                    let as_client = self.core.is_client;
                    self.run(
                        Op::Start {
                            dialog: Dialog::sync_receive(as_client),
                            feed: Some((msg, payload.to_vec())),
                        },
                        ctx,
                        fx,
                    );
                }
                MessageType::Accept => {
                    self.core.mode = Mode::FullSynched;
                    self.run(
                        Op::Start {
                            dialog: Dialog::full_sync_client(),
                            feed: None,
                        },
                        ctx,
                        fx,
                    );
                }
                MessageType::Reject => info!("peer rejected watchpoint"),
                MessageType::WriteAvail => {}
                other => debug!("no dialog for {}", other.name()),
            }
        } else {
            self.run(Op::Deliver(Call::Msg(msg, payload.to_vec())), ctx, fx);
        }

        if self.stack.is_empty() && self.core.pending_sync {
            self.start_sync(ctx, fx);
        }
    }

    /// The 1-second sync timer fired.
    pub fn on_timer(&mut self, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        self.core.timer_armed = false;
        if self.core.mode < Mode::FullSynched {
            return;
        }
        if !self.stack.is_empty() {
            self.core.pending_sync = true;
        } else {
            self.start_sync(ctx, fx);
        }
    }

    /// Fan-in from the watchpoint: a local change was observed.
    pub fn file_changed(
        &mut self,
        key: &str,
        state: FileState,
        lock_owner: Option<LockToken>,
        fx: &mut Vec<Effect>,
    ) {
        self.core.add_to_log(key, state, lock_owner, true, fx);
    }

    /// Fan-in from the watchpoint: an advisory lock appeared or went away.
    pub fn filelock_changed(&mut self, wire: &mut dyn Wire, key: &str, kind: LockKind) {
        let msg = match kind {
            LockKind::Write => MessageType::CreateWriteLock,
            LockKind::Read => MessageType::CreateReadLock,
            LockKind::Release => MessageType::ReleaseLock,
        };
        wire.send(msg, key.as_bytes());
    }

    fn start_sync(&mut self, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        debug_assert!(self.core.send_log().is_empty());
        self.core.write_idx = 1 - self.core.write_idx;
        self.core.pending_sync = false;
        let as_client = self.core.is_client;
        self.run(
            Op::Start {
                dialog: Dialog::sync_send(as_client),
                feed: None,
            },
            ctx,
            fx,
        );
    }

    /// Drop every dialog, releasing locks and scratch files. Called on
    /// connection teardown; the next connect starts with a full sync.
    pub fn teardown(&mut self, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        while let Some(dialog) = self.stack.pop() {
            dialog.teardown(&mut self.core, ctx, fx);
        }
    }

    /// The dialog driver: applies flow decisions until the stack settles.
    fn run(&mut self, first: Op, ctx: &mut Ctx, fx: &mut Vec<Effect>) {
        let mut op = first;
        loop {
            match op {
                Op::Start { mut dialog, feed } => match dialog.start(&mut self.core, ctx, fx) {
                    Flow::Keep => {
                        self.stack.push(dialog);
                        match feed {
                            Some((msg, payload)) => op = Op::Deliver(Call::Msg(msg, payload)),
                            None => return,
                        }
                    }
                    Flow::End => {
                        dialog.teardown(&mut self.core, ctx, fx);
                        op = Op::Deliver(Call::PopUp);
                    }
                    Flow::Push(child) => {
                        self.stack.push(dialog);
                        op = Op::Start {
                            dialog: *child,
                            feed: None,
                        };
                    }
                    Flow::PushFeed(child, msg, payload) => {
                        self.stack.push(dialog);
                        op = Op::Start {
                            dialog: *child,
                            feed: Some((msg, payload)),
                        };
                    }
                },
                Op::Deliver(call) => {
                    let Some(mut top) = self.stack.pop() else { return };
                    let flow = match call {
                        Call::Msg(msg, ref payload) => {
                            top.on_message(&mut self.core, ctx, msg, payload, fx)
                        }
                        Call::PopUp => top.pop_up(&mut self.core, ctx, fx),
                    };
                    match flow {
                        Flow::Keep => {
                            self.stack.push(top);
                            return;
                        }
                        Flow::End => {
                            top.teardown(&mut self.core, ctx, fx);
                            op = Op::Deliver(Call::PopUp);
                        }
                        Flow::Push(child) => {
                            self.stack.push(top);
                            op = Op::Start {
                                dialog: *child,
                                feed: None,
                            };
                        }
                        Flow::PushFeed(child, msg, payload) => {
                            self.stack.push(top);
                            op = Op::Start {
                                dialog: *child,
                                feed: Some((msg, payload)),
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Payload-as-path helper; peers send plain UTF-8 keys.
pub fn text(payload: &[u8]) -> String {
    let trimmed = payload.strip_suffix(&[0]).unwrap_or(payload);
    String::from_utf8_lossy(trimmed).into_owned()
}
