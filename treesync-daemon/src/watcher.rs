//! Directory watching: adapts `notify` events into debounced
//! "directory changed" ticks keyed by watchpoint and directory.
//!
//! The kernel-side mechanism is opaque here; whatever fires, the engine
//! only ever learns that a directory needs a rescan, at most once per
//! second per directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::daemon::Event;

/// Minimum spacing between rescans of the same directory.
const DEBOUNCE: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(250);

pub struct DirWatcher {
    // Dropped with the daemon; dropping stops the notify threads.
    _watchers: Vec<RecommendedWatcher>,
}

impl DirWatcher {
    /// Watch every watchpoint root recursively. Raw events are funneled
    /// through a debounce task that emits [`Event::DirChanged`].
    pub fn start(
        roots: Vec<(usize, PathBuf)>,
        events: mpsc::Sender<Event>,
    ) -> notify::Result<DirWatcher> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<(usize, PathBuf)>();

        let mut watchers = Vec::new();
        for (wp_index, root) in roots {
            let tx = raw_tx.clone();
            let watch_root = root.clone();
            let mut watcher =
                notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                    match result {
                        Ok(event) => {
                            for path in event.paths {
                                let _ = tx.send((wp_index, path.clone()));
                            }
                        }
                        Err(e) => error!("watcher error: {e}"),
                    }
                })?;
            watcher.watch(&watch_root, RecursiveMode::Recursive)?;
            info!("watching {}", root.display());
            watchers.push(watcher);
        }
        drop(raw_tx);

        tokio::task::spawn_blocking(move || debounce_loop(raw_rx, events));
        Ok(DirWatcher {
            _watchers: watchers,
        })
    }
}

/// Collect raw paths, reduce them to their parent directory, and emit
/// each directory at most once per debounce interval.
fn debounce_loop(
    raw_rx: std::sync::mpsc::Receiver<(usize, PathBuf)>,
    events: mpsc::Sender<Event>,
) {
    let mut due: HashMap<(usize, PathBuf), Instant> = HashMap::new();
    let mut last_fired: HashMap<(usize, PathBuf), Instant> = HashMap::new();

    loop {
        match raw_rx.recv_timeout(TICK) {
            Ok((wp_index, path)) => {
                // The rescan unit is the containing directory.
                let dir = path.parent().map(PathBuf::from).unwrap_or(path);
                let key = (wp_index, dir);
                let now = Instant::now();
                let earliest = last_fired
                    .get(&key)
                    .map(|t| *t + DEBOUNCE)
                    .unwrap_or(now)
                    .max(now);
                due.entry(key).or_insert(earliest);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let ready: Vec<(usize, PathBuf)> = due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in ready {
            due.remove(&key);
            last_fired.insert(key.clone(), now);
            let (wp_index, dir) = key;
            if events
                .blocking_send(Event::DirChanged { wp_index, dir })
                .is_err()
            {
                return;
            }
        }

        // Stop remembering directories that have gone quiet.
        last_fired.retain(|_, fired| now.duration_since(*fired) < 10 * DEBOUNCE);
        if last_fired.len() > 10_000 {
            warn!("watch debounce table unusually large, clearing");
            last_fired.clear();
        }
    }
}
