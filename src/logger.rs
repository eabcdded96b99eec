use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Diagnostic sink injected into every component.
///
/// There is no structured error channel back to the peer; everything an
/// operator learns about a session goes through this trait.
pub trait Logger: Send + Sync {
    fn session_start(&self, _peer: &str, _root: &Path) {}
    fn entry_error(&self, _context: &str, _path: &Path, _msg: &str) {}
    /// Observed diff size disagreeing with the naive |local - remote|
    /// expectation. Diagnostic only - the formula is approximate.
    fn diff_note(&self, _diff: usize, _local: usize, _remote: usize) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Operator console logging on stderr.
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn session_start(&self, peer: &str, root: &Path) {
        eprintln!("session: peer={} root={}", peer, root.display());
    }
    fn entry_error(&self, context: &str, path: &Path, msg: &str) {
        eprintln!("{}: {}: {}", context, path.display(), msg);
    }
    fn diff_note(&self, diff: usize, local: usize, remote: usize) {
        eprintln!(
            "diff count {} disagrees with expectation (local {} / remote {})",
            diff, local, remote
        );
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        eprintln!("done: files={} bytes={} seconds={:.3}", files, bytes, seconds);
    }
}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_start(&self, peer: &str, root: &Path) {
        self.line(&format!("START peer={} root={}", peer, root.display()));
    }
    fn entry_error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn diff_note(&self, diff: usize, local: usize, remote: usize) {
        self.line(&format!("DIFF diff={} local={} remote={}", diff, local, remote));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Captures log lines in memory so tests can assert on diagnostics.
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push(&self, s: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(s);
        }
    }
}

impl Logger for MemoryLogger {
    fn session_start(&self, peer: &str, root: &Path) {
        self.push(format!("START peer={} root={}", peer, root.display()));
    }
    fn entry_error(&self, context: &str, path: &Path, msg: &str) {
        self.push(format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn diff_note(&self, diff: usize, local: usize, remote: usize) {
        self.push(format!("DIFF diff={} local={} remote={}", diff, local, remote));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.push(format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
