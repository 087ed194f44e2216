//! Three-way reconciliation of the client snapshot, the received server
//! snapshot and the last-sync snapshot.
//!
//! All three streams are sorted by key. A key present only in the
//! last-sync witness was deleted on both sides; a key missing from one
//! current side either appeared on the other side (not in last-sync) or
//! was deleted there (in last-sync). Keys present on both sides compare
//! mtimes against the witness to pick a winner, with true conflicts
//! resolved server-wins after backing up the client copy.
//!
//! Outputs: records the *server* must replay toward the client (sent via
//! the full-sync log and folded into the server's write log), and records
//! the *client* schedules into its own write log for the next
//! incremental round.

use treesync_index::ModLog;
use treesync_proto::{action, FileState};

/// How a record entered the plan; maps onto the concrete action by the
/// file type carried in its mode bits.
#[derive(Debug, Clone, Copy)]
enum Disposition {
    New,
    Content,
    Deleted,
    Access,
}

fn with_action(mut state: FileState, disposition: Disposition) -> FileState {
    state.action = match disposition {
        Disposition::New => {
            if state.is_dir() {
                action::MKDIRED
            } else if state.is_symlink() {
                action::NEWLINK
            } else if state.is_regular() {
                action::CREATED
            } else {
                action::NONE
            }
        }
        Disposition::Content => {
            if state.is_dir() {
                action::MKDIRED
            } else if state.is_symlink() {
                action::NEWLINK
            } else if state.is_regular() {
                action::CHANGED
            } else {
                action::NONE
            }
        }
        Disposition::Deleted => {
            if state.is_dir() {
                action::RMDIRED
            } else {
                action::REMOVED
            }
        }
        Disposition::Access => action::NEWACCESS,
    };
    state
}

#[derive(Debug, Default)]
pub struct Reconciled {
    /// Directed at the server: it folds these into its write log and
    /// replays them toward us on the next incremental round.
    pub to_server: ModLog,
    /// Scheduled into the client's own write log.
    pub to_client: Vec<(String, FileState)>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.to_server.is_empty() && self.to_client.is_empty()
    }
}

/// Merge the three sorted streams. `backup` is invoked for every client
/// path about to be overwritten by a conflicting server version.
pub fn reconcile(
    client: impl IntoIterator<Item = (String, FileState)>,
    server: impl IntoIterator<Item = (String, FileState)>,
    last_sync: impl IntoIterator<Item = (String, FileState)>,
    backup: &mut dyn FnMut(&str),
) -> Reconciled {
    let mut client = client.into_iter().peekable();
    let mut server = server.into_iter().peekable();
    let mut witness = last_sync.into_iter().peekable();
    let mut out = Reconciled::default();

    loop {
        let ck = client.peek().map(|(k, _)| k.clone());
        let sk = server.peek().map(|(k, _)| k.clone());
        let lk = witness.peek().map(|(k, _)| k.clone());

        let (ck, sk) = match (ck, sk) {
            (None, None) => break,
            pair => pair,
        };

        // A key surviving only in the witness: deleted on both sides.
        if let Some(lk) = &lk {
            let before_client = ck.as_ref().map_or(true, |c| lk < c);
            let before_server = sk.as_ref().map_or(true, |s| lk < s);
            if before_client && before_server {
                witness.next();
                continue;
            }
        }

        let client_first = match (&ck, &sk) {
            (Some(c), Some(s)) => {
                if c < s {
                    Some(true)
                } else if s < c {
                    Some(false)
                } else {
                    None
                }
            }
            (Some(_), None) => Some(true),
            (None, Some(_)) => Some(false),
            (None, None) => unreachable!(),
        };

        match client_first {
            Some(true) => {
                let (key, state) = client.next().expect("peeked");
                if lk.as_deref() == Some(key.as_str()) {
                    // In the witness: the server deleted it.
                    witness.next();
                    out.to_server
                        .insert(&key, with_action(state, Disposition::Deleted));
                } else {
                    out.to_client
                        .push((key, with_action(state, Disposition::New)));
                }
            }
            Some(false) => {
                let (key, state) = server.next().expect("peeked");
                if lk.as_deref() == Some(key.as_str()) {
                    // In the witness: the client deleted it.
                    witness.next();
                    out.to_client
                        .push((key, with_action(state, Disposition::Deleted)));
                } else {
                    out.to_server
                        .insert(&key, with_action(state, Disposition::New));
                }
            }
            None => {
                let (key, client_state) = client.next().expect("peeked");
                let (_, server_state) = server.next().expect("peeked");
                let witness_mtime = if lk.as_deref() == Some(key.as_str()) {
                    witness.next().map(|(_, s)| s.mtime).unwrap_or(0)
                } else {
                    0
                };
                merge_common(
                    &key,
                    client_state,
                    server_state,
                    witness_mtime,
                    backup,
                    &mut out,
                );
            }
        }
    }

    out
}

fn merge_common(
    key: &str,
    client_state: FileState,
    server_state: FileState,
    witness_mtime: i64,
    backup: &mut dyn FnMut(&str),
    out: &mut Reconciled,
) {
    let both_links = client_state.is_symlink() && server_state.is_symlink();
    let content_differs = client_state.md4 != server_state.md4;

    if !(client_state.is_dir() && server_state.is_dir()) {
        if client_state.mtime > witness_mtime
            && server_state.mtime > witness_mtime
            && client_state.mtime != server_state.mtime
        {
            // Both sides touched it since the last sync: a conflict. The
            // server wins; the client copy is preserved first.
            if content_differs {
                backup(key);
                out.to_server
                    .insert(key, with_action(server_state, Disposition::Content));
            } else if !both_links {
                out.to_server
                    .insert(key, with_action(server_state, Disposition::Access));
            }
            return;
        }

        if client_state.mtime > server_state.mtime {
            if content_differs {
                out.to_client
                    .push((key.to_string(), with_action(client_state, Disposition::Content)));
            } else if !both_links {
                out.to_client
                    .push((key.to_string(), with_action(client_state, Disposition::Access)));
            }
            return;
        }

        if server_state.mtime > client_state.mtime {
            if content_differs {
                out.to_server
                    .insert(key, with_action(server_state, Disposition::Content));
            } else if !both_links {
                out.to_server
                    .insert(key, with_action(server_state, Disposition::Access));
            }
            return;
        }
    }

    // Directories, or equal mtimes: reduce to access and content checks.
    if client_state.mode != server_state.mode
        || client_state.uid != server_state.uid
        || client_state.gid != server_state.gid
    {
        if client_state.ctime > server_state.ctime {
            out.to_client
                .push((key.to_string(), with_action(client_state, Disposition::Access)));
        } else {
            out.to_server
                .insert(key, with_action(server_state, Disposition::Access));
        }
    }

    if content_differs {
        backup(key);
        out.to_server
            .insert(key, with_action(server_state, Disposition::Content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REG: u32 = 0o100644;
    const DIR: u32 = 0o040755;
    const LNK: u32 = 0o120777;

    fn state(mode: u32, mtime: i64, md4_seed: u8) -> FileState {
        FileState {
            md4: [md4_seed; 16],
            uid: 1000,
            gid: 1000,
            mode,
            mtime,
            ctime: mtime,
            size: 1,
            action: 0,
        }
    }

    fn run(
        client: Vec<(&str, FileState)>,
        server: Vec<(&str, FileState)>,
        witness: Vec<(&str, FileState)>,
    ) -> (Reconciled, Vec<String>) {
        let mut backups = Vec::new();
        let result = reconcile(
            client.into_iter().map(|(k, s)| (k.to_string(), s)),
            server.into_iter().map(|(k, s)| (k.to_string(), s)),
            witness.into_iter().map(|(k, s)| (k.to_string(), s)),
            &mut |key| backups.push(key.to_string()),
        );
        (result, backups)
    }

    #[test]
    fn new_on_client_goes_to_client_log() {
        let (out, backups) = run(vec![("/new", state(REG, 10, 1))], vec![], vec![]);
        assert!(backups.is_empty());
        assert!(out.to_server.is_empty());
        assert_eq!(out.to_client.len(), 1);
        assert_eq!(out.to_client[0].1.action, action::CREATED);
    }

    #[test]
    fn new_on_server_goes_to_server_log() {
        let (out, _) = run(vec![], vec![("/new", state(REG, 10, 1))], vec![]);
        assert_eq!(out.to_server.get("/new").unwrap().action, action::CREATED);
        assert!(out.to_client.is_empty());
    }

    #[test]
    fn deleted_on_server_deletes_on_client() {
        let held = state(REG, 10, 1);
        let (out, _) = run(
            vec![("/f", held)],
            vec![],
            vec![("/f", held)],
        );
        // The removal record rides the server log and is replayed toward
        // the client, the side that still holds the file.
        assert_eq!(out.to_server.get("/f").unwrap().action, action::REMOVED);
        assert!(out.to_client.is_empty());
    }

    #[test]
    fn deleted_on_both_sides_is_silent() {
        let held = state(REG, 10, 1);
        let (out, _) = run(vec![], vec![], vec![("/f", held)]);
        assert!(out.is_empty());
    }

    #[test]
    fn conflict_backs_up_client_and_server_wins() {
        let witness = state(REG, 10, 0);
        let client = state(REG, 20, 1);
        let server = state(REG, 30, 2);
        let (out, backups) = run(
            vec![("/f", client)],
            vec![("/f", server)],
            vec![("/f", witness)],
        );
        assert_eq!(backups, ["/f"]);
        assert_eq!(out.to_server.get("/f").unwrap().action, action::CHANGED);
        assert!(out.to_client.is_empty());
    }

    #[test]
    fn newer_client_side_wins_without_conflict() {
        let witness = state(REG, 10, 1);
        let client = state(REG, 30, 2);
        let server = state(REG, 10, 1);
        let (out, backups) = run(
            vec![("/f", client)],
            vec![("/f", server)],
            vec![("/f", witness)],
        );
        assert!(backups.is_empty());
        assert!(out.to_server.is_empty());
        assert_eq!(out.to_client[0].1.action, action::CHANGED);
    }

    #[test]
    fn access_only_change_on_symlinks_is_ignored() {
        let mut client = state(LNK, 30, 5);
        client.mode = LNK;
        let server = state(LNK, 10, 5);
        let (out, _) = run(vec![("/l", client)], vec![("/l", server)], vec![]);
        assert!(out.is_empty());
    }

    #[test]
    fn directories_only_compare_access() {
        let mut client = state(DIR, 50, 0);
        let mut server = state(DIR, 10, 0);
        client.mode = DIR;
        server.mode = 0o040700;
        server.ctime = 100; // later ctime wins
        let (out, _) = run(vec![("/d", client)], vec![("/d", server)], vec![]);
        assert!(out.to_client.is_empty());
        assert_eq!(out.to_server.get("/d").unwrap().action, action::NEWACCESS);
    }

    #[test]
    fn equal_mtime_with_differing_content_defers_to_server() {
        let client = state(REG, 10, 1);
        let server = state(REG, 10, 2);
        let (out, backups) = run(vec![("/f", client)], vec![("/f", server)], vec![]);
        assert_eq!(backups, ["/f"]);
        assert_eq!(out.to_server.get("/f").unwrap().action, action::CHANGED);
    }
}
