//! Two peers wired back to back in memory: a server exporting a tree and
//! a client importing it, with real files on tempdirs underneath. The
//! harness plays the roles of connection and event loop: it shuttles
//! frames, fires sync timers and applies session effects.

use std::collections::VecDeque;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tempfile::TempDir;
use treesync_engine::{Ctx, Effect, Session, SoftLocks, WatchPoint, WatchPointOptions, Wire};
use treesync_proto::MessageType;

struct TestWire {
    queue: VecDeque<(MessageType, Vec<u8>)>,
}

impl Wire for TestWire {
    fn send(&mut self, msg: MessageType, payload: &[u8]) {
        self.queue.push_back((msg, payload.to_vec()));
    }

    fn write_bytes_pending(&self) -> bool {
        false
    }
}

struct Peer {
    wp: WatchPoint,
    session: Session,
    locks: SoftLocks,
    wire: TestWire,
    root: TempDir,
    _state: TempDir,
}

impl Peer {
    fn new(is_client: bool, readonly: bool, token: u64) -> Peer {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let wp = WatchPoint::new(WatchPointOptions {
            path: root.path().to_path_buf(),
            export: "share".into(),
            readonly,
            include: Vec::new(),
            exclude: Vec::new(),
            state_root: state.path().to_path_buf(),
        })
        .unwrap();
        Peer {
            wp,
            session: Session::new(token, is_client, None),
            locks: SoftLocks::new(),
            wire: TestWire {
                queue: VecDeque::new(),
            },
            root,
            _state: state,
        }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.root.path().join(rel)
    }

    fn write(&self, rel: &str, data: &[u8]) {
        let full = self.path(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, data).unwrap();
    }

    fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.path(rel)).unwrap()
    }

    /// Scan the tree without feeding the session, as happens while no
    /// peer is connected.
    fn scan_detached(&mut self) {
        let _ = self.wp.rescan("", None);
    }

    /// A watcher tick: rescan and fan the changes into the session.
    fn scan(&mut self) {
        let changes = self.wp.rescan("", None);
        let root = self.wp.path().to_string();
        for change in changes {
            let owner = self.locks.owner(&format!("{root}{}", change.key));
            let mut fx = Vec::new();
            self.session
                .file_changed(&change.key, change.state, owner, &mut fx);
            // Only timer arming can come out of a log insert.
            assert!(fx
                .iter()
                .all(|e| matches!(e, Effect::ArmSyncTimer)));
        }
    }

    fn deliver(&mut self, msg: MessageType, payload: &[u8]) {
        let mut fx = Vec::new();
        {
            let mut ctx = Ctx {
                wp: &mut self.wp,
                wire: &mut self.wire,
                locks: &mut self.locks,
            };
            self.session.on_frame(&mut ctx, msg, payload, &mut fx);
        }
        self.apply(fx);
    }

    fn fire_timer(&mut self) -> bool {
        if !self.session.core.timer_armed {
            return false;
        }
        let mut fx = Vec::new();
        {
            let mut ctx = Ctx {
                wp: &mut self.wp,
                wire: &mut self.wire,
                locks: &mut self.locks,
            };
            self.session.on_timer(&mut ctx, &mut fx);
        }
        self.apply(fx);
        true
    }

    fn apply(&mut self, fx: Vec<Effect>) {
        for effect in fx {
            match effect {
                Effect::ArmSyncTimer => {}
                Effect::UnlockRescan { key, md4 } => {
                    let changes = self.wp.rescan(&key, Some(&md4));
                    let root = self.wp.path().to_string();
                    for change in changes {
                        let owner = self.locks.owner(&format!("{root}{}", change.key));
                        let mut nested = Vec::new();
                        self.session.file_changed(
                            &change.key,
                            change.state,
                            owner,
                            &mut nested,
                        );
                    }
                    self.locks.unlock(&format!("{root}{key}"));
                }
                Effect::FileLock { .. } => {}
                Effect::Disconnect => panic!("unexpected disconnect"),
            }
        }
    }
}

fn pump(a: &mut Peer, b: &mut Peer) {
    loop {
        let mut progressed = false;
        while let Some((msg, payload)) = a.wire.queue.pop_front() {
            b.deliver(msg, &payload);
            progressed = true;
        }
        while let Some((msg, payload)) = b.wire.queue.pop_front() {
            a.deliver(msg, &payload);
            progressed = true;
        }
        if !progressed {
            return;
        }
    }
}

/// Run frames and timers until both peers go quiet.
fn settle(a: &mut Peer, b: &mut Peer) {
    for _ in 0..60 {
        pump(a, b);
        let fired = a.fire_timer() | b.fire_timer();
        pump(a, b);
        if !fired && a.wire.queue.is_empty() && b.wire.queue.is_empty() {
            return;
        }
    }
    panic!("peers did not reach quiescence");
}

/// Accept the client's registration and run the initial full sync.
fn connect(client: &mut Peer, server: &mut Peer) {
    client.deliver(MessageType::Accept, &[]);
    settle(client, server);
}

fn set_mtime(path: &Path, mtime: i64) {
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    let times = libc::utimbuf {
        actime: mtime,
        modtime: mtime,
    };
    assert_eq!(unsafe { libc::utime(c_path.as_ptr(), &times) }, 0);
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[test]
fn initial_full_sync_converges_both_directions() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);

    server.write("on_server.txt", b"from the server");
    server.write("shared/deep.txt", b"deep content");
    client.write("on_client.txt", b"from the client");

    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    assert_eq!(client.read("on_server.txt"), b"from the server");
    assert_eq!(client.read("shared/deep.txt"), b"deep content");
    assert_eq!(server.read("on_client.txt"), b"from the client");

    // The client persisted its last-sync witness.
    assert!(client.wp.last_sync_state_path().exists());

    // Scratch snapshots were cleaned up on both sides.
    let count = |peer: &Peer| {
        fs::read_dir(peer.root.path().join(".tsynctmp"))
            .unwrap()
            .count()
    };
    assert_eq!(count(&client), 0);
    assert_eq!(count(&server), 0);
}

#[test]
fn incremental_create_and_modify_propagate() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    // Server-side creation flows to the client.
    server.write("fresh.txt", b"abc");
    server.scan();
    settle(&mut client, &mut server);
    assert_eq!(client.read("fresh.txt"), b"abc");

    // Client-side modification flows back with identical fingerprints.
    client.write("fresh.txt", b"abc and then some");
    set_mtime(&client.path("fresh.txt"), epoch_now() + 5);
    client.scan();
    settle(&mut client, &mut server);
    assert_eq!(server.read("fresh.txt"), b"abc and then some");

    let client_md4 = client.wp.db.get("/fresh.txt").unwrap().md4;
    let server_md4 = server.wp.db.get("/fresh.txt").unwrap().md4;
    assert_eq!(client_md4, server_md4);

    // Deletion propagates too.
    fs::remove_file(client.path("fresh.txt")).unwrap();
    client.scan();
    settle(&mut client, &mut server);
    assert!(!server.path("fresh.txt").exists());
}

#[test]
fn offline_conflict_backs_up_the_older_side() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);

    server.write("doc.txt", b"common ancestor");
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);
    assert_eq!(client.read("doc.txt"), b"common ancestor");

    // Both sides edit while "offline"; the server copy is newer.
    let now = epoch_now();
    client.write("doc.txt", b"client edit");
    set_mtime(&client.path("doc.txt"), now + 100);
    server.write("doc.txt", b"server edit wins");
    set_mtime(&server.path("doc.txt"), now + 200);
    client.scan_detached();
    server.scan_detached();

    // Reconnect: fresh sessions, the trees and witness survive.
    client.session = Session::new(4, true, None);
    server.session = Session::new(3, false, None);
    connect(&mut client, &mut server);

    assert_eq!(client.read("doc.txt"), b"server edit wins");
    assert_eq!(server.read("doc.txt"), b"server edit wins");

    // The losing copy survives as a revision backup with write bits
    // stripped, only on the losing side.
    assert_eq!(client.read("doc-1.txt"), b"client edit");
    let mode = fs::metadata(client.path("doc-1.txt")).unwrap().mode();
    assert_eq!(mode & 0o224, 0);
    assert!(!server.path("doc-1.txt").exists());
}

#[test]
fn directory_rename_collapses_subtree() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);

    client.write("x/a.txt", b"one");
    client.write("x/sub/b.txt", b"two");
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);
    assert_eq!(server.read("x/sub/b.txt"), b"two");

    fs::rename(client.path("x"), client.path("y")).unwrap();
    client.scan();
    settle(&mut client, &mut server);

    assert!(!server.path("x").exists());
    assert_eq!(server.read("y/a.txt"), b"one");
    assert_eq!(server.read("y/sub/b.txt"), b"two");
    assert!(server.wp.db.get("/x").is_none());
    assert!(server.wp.db.get("/x/a.txt").is_none());
}

#[test]
fn symlink_propagates_with_target() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    // A dangling target keeps the access application away from any
    // real file behind the link.
    std::os::unix::fs::symlink("/nowhere/in/particular", client.path("link")).unwrap();
    client.scan();
    settle(&mut client, &mut server);

    let target = fs::read_link(server.path("link")).unwrap();
    assert_eq!(target, Path::new("/nowhere/in/particular"));
}

#[test]
fn readonly_server_refuses_and_reverts_the_client() {
    let mut server = Peer::new(false, true, 1);
    let mut client = Peer::new(true, false, 2);

    server.write("r.txt", b"authoritative");
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);
    assert_eq!(client.read("r.txt"), b"authoritative");

    client.write("r.txt", b"client tampering");
    set_mtime(&client.path("r.txt"), epoch_now() + 5);
    client.scan();
    settle(&mut client, &mut server);

    // The server never changed, and its inverse record restored the
    // authoritative content on the client.
    assert_eq!(server.read("r.txt"), b"authoritative");
    assert_eq!(client.read("r.txt"), b"authoritative");
}

#[test]
fn readonly_server_inverts_a_creation_into_removal() {
    let mut server = Peer::new(false, true, 1);
    let mut client = Peer::new(true, false, 2);
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    client.write("intruder.txt", b"should not exist");
    client.scan();
    settle(&mut client, &mut server);

    assert!(!server.path("intruder.txt").exists());
    assert!(!client.path("intruder.txt").exists());
}

#[test]
fn locked_paths_reject_the_round_and_retry_succeeds() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    client.write("busy.txt", b"payload");
    client.scan();

    // Another connection is applying to the same path on the server.
    let foreign = format!("{}/busy.txt", server.wp.path());
    assert!(server.locks.lock(&foreign, 99));

    assert!(client.fire_timer());
    pump(&mut client, &mut server);

    // The server rejected; nothing landed, and the client re-armed.
    assert!(!server.path("busy.txt").exists());
    assert!(client.session.core.timer_armed);

    server.locks.unlock(&foreign);
    settle(&mut client, &mut server);
    assert_eq!(server.read("busy.txt"), b"payload");
}

#[test]
fn simultaneous_rounds_resolve_with_client_yielding() {
    let mut server = Peer::new(false, false, 1);
    let mut client = Peer::new(true, false, 2);
    server.scan_detached();
    client.scan_detached();
    connect(&mut client, &mut server);

    client.write("from_client.txt", b"c");
    server.write("from_server.txt", b"s");
    client.scan();
    server.scan();

    // Fire both timers before exchanging a single frame: both sides
    // open a round at once.
    assert!(client.fire_timer());
    assert!(server.fire_timer());
    settle(&mut client, &mut server);

    assert_eq!(server.read("from_client.txt"), b"c");
    assert_eq!(client.read("from_server.txt"), b"s");
}
