//! Session orchestration over TCP: the serve-side handler and the
//! connect-side requester
//!
//! One session = one connection: the requester announces its catalog, the
//! server diffs it against a fresh local scan and streams back exactly the
//! entries the requester lacks. The serve side runs one thread per accepted
//! connection; sessions share nothing and each performs its own scan.

use crate::catalog::scan;
use crate::diff::missing;
use crate::handshake::{recv_catalog, send_catalog};
use crate::logger::Logger;
use crate::protocol::timeouts;
use crate::tar_stream::{archive_entries, unarchive_stream, FailurePolicy, TransferStats};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Per-session knobs shared by both roles.
#[derive(Debug, Clone, Copy)]
pub struct SyncOpts {
    /// Hash file contents during scans; when off, comparison weakens to
    /// size+path
    pub checksum: bool,
    /// Socket read/write deadline; `None` leaves the socket unbounded
    pub io_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    /// Suppress the pull-side progress spinner
    pub quiet: bool,
}

impl Default for SyncOpts {
    fn default() -> Self {
        Self {
            checksum: true,
            io_timeout: Some(Duration::from_secs(timeouts::SESSION_IO_SECS)),
            failure_policy: FailurePolicy::default(),
            quiet: true,
        }
    }
}

fn tune_socket(stream: &TcpStream, opts: &SyncOpts) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(opts.io_timeout);
    let _ = stream.set_write_timeout(opts.io_timeout);
}

/// Bind and serve until the listener fails.
pub fn serve(bind: &str, root: &Path, opts: SyncOpts, logger: Arc<dyn Logger>) -> Result<()> {
    let listener = TcpListener::bind(bind).with_context(|| format!("bind {}", bind))?;
    serve_on(listener, root, opts, logger)
}

/// Accept loop over an already-bound listener. Each connection gets its own
/// thread running the full server-side session; a failed session tears down
/// only that connection.
pub fn serve_on(
    listener: TcpListener,
    root: &Path,
    opts: SyncOpts,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        eprintln!("dsync listening on {} root={}", addr, root.display());
    }
    for conn in listener.incoming() {
        match conn {
            Ok(mut stream) => {
                let root = root.to_path_buf();
                let logger = Arc::clone(&logger);
                thread::spawn(move || {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    if let Err(e) = handle_conn(&mut stream, &root, opts, logger.as_ref(), &peer) {
                        logger.entry_error("session", &root, &format!("peer {}: {:#}", peer, e));
                    }
                });
            }
            Err(e) => {
                eprintln!("accept error: {}", e);
            }
        }
    }
    Ok(())
}

fn handle_conn(
    stream: &mut TcpStream,
    root: &Path,
    opts: SyncOpts,
    logger: &dyn Logger,
    peer: &str,
) -> Result<()> {
    tune_socket(stream, &opts);
    logger.session_start(peer, root);
    let started = Instant::now();

    let (remote_count, theirs) = recv_catalog(stream).context("handshake")?;
    let ours = scan(root, opts.checksum).context("scan")?;
    let wanted = missing(&ours, &theirs);

    // Naive size-delta expectation; approximate by construction (changed
    // files and asymmetry are invisible to it), logged only
    let expected = (ours.len() as i64 - i64::from(remote_count)).unsigned_abs() as usize;
    if wanted.len() != expected {
        logger.diff_note(wanted.len(), ours.len(), remote_count as usize);
    }

    let stats = archive_entries(&wanted, &mut *stream, root, opts.failure_policy, logger)?;
    logger.done(stats.files, stats.bytes, started.elapsed().as_secs_f64());
    Ok(())
}

/// Run one client-side session: announce what we have, then materialize
/// whatever the server decides we lack.
pub fn pull(addr: &str, root: &Path, opts: SyncOpts, logger: &dyn Logger) -> Result<TransferStats> {
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?;
    tune_socket(&stream, &opts);
    logger.session_start(addr, root);
    let started = Instant::now();

    fs::create_dir_all(root).with_context(|| format!("create root {}", root.display()))?;
    let ours = scan(root, opts.checksum).context("scan")?;
    send_catalog(&mut stream, &ours).context("handshake")?;

    let progress = if opts.quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("Receiving files...");
        Some(pb)
    };

    let stats = unarchive_stream(&mut stream, root, opts.failure_policy, logger)?;

    if let Some(pb) = progress {
        pb.finish_with_message(format!(
            "Received {} files ({} bytes)",
            stats.files, stats.bytes
        ));
    }
    logger.done(stats.files, stats.bytes, started.elapsed().as_secs_f64());
    Ok(stats)
}
