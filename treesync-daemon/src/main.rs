use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use treesync_daemon::config::{Config, DEFAULT_CONFIG_PATH};
use treesync_daemon::daemon::{Daemon, Event};

#[derive(Parser, Debug)]
#[command(name = "treesyncd", version, about = "Peer-to-peer file tree synchronization daemon")]
struct Args {
    /// Don't daemonize; print log messages to stderr
    #[arg(short, long)]
    debug: bool,

    /// Increase verbosity, may be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable advisory lock detection
    #[arg(short = 'l', long = "no-locks")]
    no_locks: bool,

    /// Path to an alternate configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            eprint!("{e}");
            return ExitCode::from(1);
        }
        Err(e) => {
            // --help and --version land here.
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let level = match args.verbose.max(if args.debug { 1 } else { 0 }) {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // chmod/chown of arbitrary files requires root.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("treesyncd must be run as root");
        return ExitCode::from(1);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(1);
        }
    };

    // Fork before the runtime exists; tokio threads do not survive one.
    if !args.debug && unsafe { libc::daemon(0, 0) } != 0 {
        eprintln!(
            "daemonizing failed: {}",
            std::io::Error::last_os_error()
        );
        return ExitCode::from(2);
    }

    info!("{} started", treesync_daemon::banner());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(async move {
        let mut daemon = Daemon::new(config, !args.no_locks)?;

        let shutdown_tx = daemon.events_sender();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("terminating");
            let _ = shutdown_tx.send(Event::Shutdown).await;
        });

        daemon.run().await
    });

    match result {
        Ok(()) => {
            info!("treesyncd finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
