//! Outbound connections: the SSH tunnel subprocess and the per-watchpoint
//! reconnect backoff.
//!
//! Connecting through SSH is two-staged. The first attempt spawns the
//! tunnel (as the configured non-root user) and reports back so the
//! driver re-arms in ten seconds; the second attempt checks the child is
//! still alive and dials the local forward.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{error, info};

use crate::config::{lookup_user, Config, ImportConfig};

/// Backoff starts here and grows by the same step per idle round.
const BACKOFF_START: Duration = Duration::from_secs(20);
/// Upper bound of ten minutes between reconnect rounds.
const BACKOFF_MAX: Duration = Duration::from_secs(600);
/// Time the tunnel gets to come up before the connect attempt.
pub const SSH_GRACE: Duration = Duration::from_secs(10);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-watchpoint reconnect bookkeeping.
pub struct ReconnectState {
    pub next_import: usize,
    pub armed: bool,
    timeout: Duration,
    last_round: Option<Instant>,
}

impl ReconnectState {
    pub fn new() -> ReconnectState {
        ReconnectState {
            next_import: 0,
            armed: false,
            timeout: BACKOFF_START,
            last_round: None,
        }
    }

    /// Called when the timer fires: a long quiet spell (or a recent
    /// disconnect) resets the backoff to its base.
    pub fn begin_round(&mut self) {
        if self
            .last_round
            .map_or(true, |at| at.elapsed() > BACKOFF_START)
        {
            self.timeout = BACKOFF_START;
        }
        self.last_round = Some(Instant::now());
    }

    /// All imports inspected without a connect; grow the backoff.
    pub fn idle_delay(&mut self) -> Duration {
        let delay = self.timeout;
        self.timeout = (self.timeout + BACKOFF_START).min(BACKOFF_MAX);
        delay
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

/// A running ssh port forward.
pub struct Tunnel {
    pub child: Child,
    pub local_port: u16,
}

impl Tunnel {
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn stop(mut self) {
        info!("stopping ssh tunnel on port {}", self.local_port);
        let _ = self.child.kill().await;
    }
}

/// Spawn `ssh -N -L <local>:<server>:<port> user@gateway`, dropping to
/// the configured non-root user first.
pub fn start_tunnel(config: &Config, import: &ImportConfig) -> Option<Tunnel> {
    let local_port = free_local_port()?;
    let forward = format!("{}:{}:{}", local_port, import.server, import.port);
    let host = format!("{}@{}", import.user, import.gateway);

    let mut command = Command::new(&config.ssh_command);
    command
        .arg("-N")
        .arg("-q")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-L")
        .arg(&forward)
        .arg(&host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);

    if let Some((uid, _)) = lookup_user(&config.ssh_user) {
        if uid != 0 {
            unsafe {
                command.pre_exec(move || {
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }

    match command.spawn() {
        Ok(child) => {
            info!(
                "ssh tunnel started: {} -L {} {}",
                config.ssh_command.display(),
                forward,
                host
            );
            Some(Tunnel { child, local_port })
        }
        Err(e) => {
            error!("cannot start {}: {}", config.ssh_command.display(), e);
            None
        }
    }
}

/// Connect with a bounded wait; `None` covers both refusal and timeout.
pub async fn dial(host: &str, port: u16) -> Option<TcpStream> {
    info!("connecting to {host}:{port}");
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            info!("connect to {host}:{port} failed: {e}");
            None
        }
        Err(_) => {
            info!("connect to {host}:{port} timed out");
            None
        }
    }
}

fn free_local_port() -> Option<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).ok()?;
    Some(listener.local_addr().ok()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut state = ReconnectState::new();
        state.begin_round();
        let mut delays = Vec::new();
        for _ in 0..40 {
            delays.push(state.idle_delay());
            state.last_round = Some(Instant::now());
        }
        assert_eq!(delays[0], Duration::from_secs(20));
        assert_eq!(delays[1], Duration::from_secs(40));
        assert!(delays.iter().all(|d| *d <= BACKOFF_MAX));
        assert_eq!(*delays.last().unwrap(), BACKOFF_MAX);
    }

    #[test]
    fn quiet_spell_resets_backoff() {
        let mut state = ReconnectState::new();
        state.begin_round();
        for _ in 0..10 {
            state.idle_delay();
        }
        // No round for longer than the base interval.
        state.last_round = Instant::now().checked_sub(Duration::from_secs(30));
        state.begin_round();
        assert_eq!(state.idle_delay(), BACKOFF_START);
    }

    #[test]
    fn local_ports_are_allocatable() {
        let port = free_local_port().unwrap();
        assert!(port > 0);
    }
}
