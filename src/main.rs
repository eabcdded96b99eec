//! Dsync - one-way directory synchronization over a raw TCP stream
//!
//! The connect side announces the files it already has; the listen side
//! streams back exactly what is missing or changed. Nothing is ever
//! deleted on the receiving side.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dsync::logger::{ConsoleLogger, Logger, TextLogger};
use dsync::net::{pull, serve, SyncOpts};
use dsync::tar_stream::FailurePolicy;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Dsync - one-way directory sync over a raw TCP stream"
)]
struct Args {
    /// Listen/bind address:port (server role)
    #[arg(long)]
    listen: Option<String>,

    /// Server address:port to pull from (client role)
    #[arg(long)]
    connect: Option<String>,

    /// Directory to synchronize
    #[arg(long, default_value = ".")]
    path: PathBuf,

    /// Compare by size and path only (skip content hashing)
    #[arg(long)]
    no_checksum: bool,

    /// Socket read/write deadline in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Abort a session after this many per-entry transfer failures
    #[arg(long)]
    max_entry_failures: Option<usize>,

    /// Suppress the transfer progress spinner
    #[arg(short, long)]
    quiet: bool,

    /// Write timestamped log lines to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Set up Ctrl-C handler
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let args = Args::parse();

    let logger: Arc<dyn Logger> = if let Some(ref p) = args.log_file {
        match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(_) => Arc::new(ConsoleLogger),
        }
    } else {
        Arc::new(ConsoleLogger)
    };

    let opts = SyncOpts {
        checksum: !args.no_checksum,
        io_timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
        failure_policy: FailurePolicy {
            max_entry_failures: args.max_entry_failures,
        },
        quiet: args.quiet,
    };

    if args.connect.is_none() && args.listen.is_none() {
        eprintln!("nothing to do: pass --listen and/or --connect");
        return Ok(());
    }

    // Client role first when both are given, then the server role
    if let Some(ref addr) = args.connect {
        pull(addr, &args.path, opts, logger.as_ref())?;
    }
    if let Some(ref bind) = args.listen {
        serve(bind, &args.path, opts, Arc::clone(&logger))?;
    }
    Ok(())
}
