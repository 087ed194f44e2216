//! Advisory-lock discovery via `/proc/locks`.
//!
//! Once a second the table is read and diffed against the known set by
//! (inode, device). New foreign locks resolve to a watchpoint path and
//! fan out lock notices to peer sessions; vanished locks fan out the
//! release. Every tenth pass revalidates everything, since a lock
//! released and re-acquired between reads keeps the file size stable.

use std::fs;

use tracing::{debug, info, warn};
use treesync_engine::LockKind;

const PROC_LOCKS: &str = "/proc/locks";

#[derive(Debug, Clone)]
pub struct LockNotice {
    pub wp_index: usize,
    pub key: String,
    pub kind: LockKind,
}

#[derive(Debug, Clone)]
struct KnownLock {
    inode: u64,
    device: u64,
    kind: LockKind,
    /// Resolved watchpoint path, when the inode belongs to one.
    resolved: Option<(usize, String)>,
    tag: u64,
}

pub struct LockPoll {
    enabled: bool,
    known: Vec<KnownLock>,
    last_size: usize,
    pass: u64,
    tag: u64,
    own_pid: u32,
}

impl LockPoll {
    pub fn new(enabled: bool) -> LockPoll {
        let enabled = enabled && fs::metadata(PROC_LOCKS).is_ok();
        if !enabled {
            info!("advisory lock relay disabled");
        }
        LockPoll {
            enabled,
            known: Vec::new(),
            last_size: 0,
            pass: 0,
            tag: 0,
            own_pid: std::process::id(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// One polling pass. `resolve` maps (inode, device) to a watchpoint
    /// path; the returned notices go out to the sessions.
    pub fn poll(
        &mut self,
        resolve: &mut dyn FnMut(u64, u64) -> Option<(usize, String)>,
    ) -> Vec<LockNotice> {
        if !self.enabled {
            return Vec::new();
        }

        let content = match fs::read_to_string(PROC_LOCKS) {
            Ok(content) => content,
            Err(e) => {
                warn!("cannot read {PROC_LOCKS}: {e}; disabling lock relay");
                self.enabled = false;
                return Vec::new();
            }
        };

        // A release plus a fresh acquire within one tick keeps the size
        // stable, so force a full pass every ten ticks.
        let force = self.pass % 10 == 0;
        self.pass += 1;
        if !force && content.len().abs_diff(self.last_size) <= 26 {
            return Vec::new();
        }
        self.last_size = content.len();

        self.tag += 1;
        let tag = self.tag;
        let mut notices = Vec::new();

        for line in content.lines() {
            let Some(entry) = parse_line(line) else {
                continue;
            };
            if entry.pid == self.own_pid {
                continue;
            }

            match self
                .known
                .iter_mut()
                .find(|k| k.inode == entry.inode && k.device == entry.device)
            {
                Some(known) => known.tag = tag,
                None => {
                    let resolved = resolve(entry.inode, entry.device);
                    if let Some((wp_index, key)) = &resolved {
                        info!("foreign lock on {key}");
                        notices.push(LockNotice {
                            wp_index: *wp_index,
                            key: key.clone(),
                            kind: entry.kind,
                        });
                    }
                    self.known.push(KnownLock {
                        inode: entry.inode,
                        device: entry.device,
                        kind: entry.kind,
                        resolved,
                        tag,
                    });
                }
            }
        }

        // Anything not seen this pass was released.
        self.known.retain(|known| {
            if known.tag == tag {
                return true;
            }
            if let Some((wp_index, key)) = &known.resolved {
                debug!("lock released on {key}");
                notices.push(LockNotice {
                    wp_index: *wp_index,
                    key: key.clone(),
                    kind: LockKind::Release,
                });
            }
            false
        });

        notices
    }

    /// Currently known locks of one watchpoint, for replay to a freshly
    /// attached session.
    pub fn held_for(&self, wp_index: usize) -> Vec<LockNotice> {
        self.known
            .iter()
            .filter_map(|known| {
                known.resolved.as_ref().and_then(|(index, key)| {
                    (*index == wp_index).then(|| LockNotice {
                        wp_index: *index,
                        key: key.clone(),
                        kind: known.kind,
                    })
                })
            })
            .collect()
    }
}

struct LockLine {
    pid: u32,
    inode: u64,
    device: u64,
    kind: LockKind,
}

/// `1: POSIX  ADVISORY  WRITE 1234 08:02:114 0 EOF`
fn parse_line(line: &str) -> Option<LockLine> {
    let mut fields = line.split_whitespace();
    let _id = fields.next()?;
    let _class = fields.next()?;
    let _mode = fields.next()?;
    let kind = match fields.next()? {
        "READ" => LockKind::Read,
        "WRITE" => LockKind::Write,
        _ => return None,
    };
    let pid: u32 = fields.next()?.parse().ok()?;

    let mut dev_ino = fields.next()?.split(':');
    let major: u64 = u64::from_str_radix(dev_ino.next()?, 16).ok()?;
    let minor: u64 = u64::from_str_radix(dev_ino.next()?, 16).ok()?;
    let inode: u64 = dev_ino.next()?.parse().ok()?;

    Some(LockLine {
        pid,
        inode,
        device: (major << 8) | minor,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_proc_locks_line() {
        let line = "1: POSIX  ADVISORY  WRITE 1234 08:02:114 0 EOF";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.pid, 1234);
        assert_eq!(parsed.inode, 114);
        assert_eq!(parsed.device, (8 << 8) | 2);
        assert_eq!(parsed.kind, LockKind::Write);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("2: FLOCK ADVISORY").is_none());
        assert!(parse_line("3: POSIX ADVISORY NONSENSE 1 08:02:1 0 EOF").is_none());
    }

    #[test]
    fn read_locks_parse_too() {
        let line = "7: POSIX  ADVISORY  READ 99 103:04:2977 0 EOF";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.kind, LockKind::Read);
        assert_eq!(parsed.device, (0x103 << 8) | 0x04);
    }
}
