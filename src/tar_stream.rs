//! Archive transport: tar streaming of selected entries over a connection
//!
//! The sender turns a diffed entry list into a single tar stream; the
//! receiver materializes that stream under a destination root. Both sides
//! record a per-entry outcome instead of silently skipping, so the session
//! layer can apply an abort threshold. The default policy never aborts.

use crate::catalog::FileEntry;
use crate::logger::Logger;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// What happened to one entry during archive send or receive.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Transferred { path: String, bytes: u64 },
    Skipped { path: String, reason: String },
    Failed { path: String, reason: String },
}

/// Abort threshold for per-entry failures. The default never aborts,
/// matching the continue-on-error transfer loop this makes explicit.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailurePolicy {
    pub max_entry_failures: Option<usize>,
}

impl FailurePolicy {
    fn exceeded(&self, failures: usize) -> bool {
        matches!(self.max_entry_failures, Some(max) if failures > max)
    }
}

/// Counters accumulated over one archive send or receive.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    pub outcomes: Vec<EntryOutcome>,
}

impl TransferStats {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o, EntryOutcome::Transferred { .. }))
            .count()
    }
}

/// Stream `entries` as a tar archive into `stream`, reading file bodies
/// from under `root`.
///
/// Per-entry metadata and open failures skip that entry and continue; the
/// end-of-archive trailer is written even when entries were skipped. A file
/// that comes up short after its header is committed is zero-padded to the
/// header-declared size so the archive framing never desynchronizes.
pub fn archive_entries<W: Write>(
    entries: &[FileEntry],
    stream: W,
    root: &Path,
    policy: FailurePolicy,
    logger: &dyn Logger,
) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    let mut builder = Builder::new(stream);

    for entry in entries {
        match append_entry(&mut builder, entry, root) {
            Ok(Appended::Dir) => {
                stats.dirs += 1;
                stats.outcomes.push(EntryOutcome::Transferred {
                    path: entry.path.clone(),
                    bytes: 0,
                });
            }
            Ok(Appended::File { bytes, padded: false }) => {
                stats.files += 1;
                stats.bytes += bytes;
                stats.outcomes.push(EntryOutcome::Transferred {
                    path: entry.path.clone(),
                    bytes,
                });
            }
            Ok(Appended::File { bytes, padded: true }) => {
                let reason = "source shorter than cataloged size; body zero-padded";
                logger.entry_error("archive", Path::new(&entry.path), reason);
                stats.bytes += bytes;
                stats.outcomes.push(EntryOutcome::Failed {
                    path: entry.path.clone(),
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                logger.entry_error("archive", Path::new(&entry.path), &format!("{:#}", e));
                stats.outcomes.push(EntryOutcome::Skipped {
                    path: entry.path.clone(),
                    reason: format!("{:#}", e),
                });
            }
        }
        if policy.exceeded(stats.failures()) {
            bail!(
                "aborting archive after {} per-entry failures",
                stats.failures()
            );
        }
    }

    // Trailer goes out regardless of skipped entries
    builder.finish().context("write archive trailer")?;
    Ok(stats)
}

enum Appended {
    Dir,
    File { bytes: u64, padded: bool },
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &FileEntry,
    root: &Path,
) -> Result<Appended> {
    let mut header = Header::new_gnu();
    header.set_mode(entry.perm_bits());
    header.set_mtime(entry.mtime.map(|t| t.timestamp().max(0) as u64).unwrap_or(0));

    if entry.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, &entry.path, io::empty())
            .with_context(|| format!("write header for {}", entry.path))?;
        return Ok(Appended::Dir);
    }

    // Open before committing the header: an unreadable file skips cleanly
    let file = File::open(root.join(&entry.path))
        .with_context(|| format!("open {}", entry.path))?;
    header.set_entry_type(EntryType::Regular);
    // The cataloged size is what the header promises; the body is padded
    // or truncated to match if the file changed since the scan
    header.set_size(entry.size);
    let mut body = PaddedBody::new(file, entry.size);
    builder
        .append_data(&mut header, &entry.path, &mut body)
        .with_context(|| format!("stream {}", entry.path))?;
    Ok(Appended::File {
        bytes: entry.size,
        padded: body.padded,
    })
}

/// Reads exactly `declared` bytes: the source is truncated if it grew and
/// zero-padded if it shrank or errored mid-body. The header has already
/// promised a size by the time the body streams, so short data must never
/// reach the wire short.
struct PaddedBody<R> {
    inner: Option<R>,
    remaining: u64,
    padded: bool,
}

impl<R> PaddedBody<R> {
    fn new(inner: R, declared: u64) -> Self {
        Self {
            inner: Some(inner),
            remaining: declared,
            padded: false,
        }
    }
}

impl<R: Read> Read for PaddedBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        while let Some(inner) = self.inner.as_mut() {
            match inner.read(&mut buf[..cap]) {
                Ok(0) => {
                    self.inner = None;
                    self.padded = true;
                }
                Ok(n) => {
                    self.remaining -= n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.inner = None;
                    self.padded = true;
                }
            }
        }
        for b in buf[..cap].iter_mut() {
            *b = 0;
        }
        self.remaining -= cap as u64;
        Ok(cap)
    }
}

/// Materialize a tar stream under `dest_root`.
///
/// End-of-stream terminates normally. A header decode error aborts the
/// whole receive - the format has no resynchronization marker. Per-entry
/// open/copy failures skip that entry and continue; the tar reader drains
/// any unread body when advancing, so framing stays correct.
pub fn unarchive_stream<R: Read>(
    stream: R,
    dest_root: &Path,
    policy: FailurePolicy,
    logger: &dyn Logger,
) -> Result<TransferStats> {
    fs::create_dir_all(dest_root)
        .with_context(|| format!("create destination root {}", dest_root.display()))?;

    let mut stats = TransferStats::default();
    let mut archive = Archive::new(stream);

    for next in archive.entries().context("open archive stream")? {
        let mut entry = next.context("decode archive header")?;
        let rel = match entry.path() {
            Ok(p) => p.into_owned(),
            Err(_) => {
                let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                logger.entry_error("unarchive", Path::new(&raw), "undecodable entry path");
                stats.outcomes.push(EntryOutcome::Skipped {
                    path: raw,
                    reason: "undecodable entry path".to_string(),
                });
                continue;
            }
        };
        let Some(target) = join_under(dest_root, &rel) else {
            let reason = "path escapes destination root";
            logger.entry_error("unarchive", &rel, reason);
            stats.outcomes.push(EntryOutcome::Skipped {
                path: rel.display().to_string(),
                reason: reason.to_string(),
            });
            continue;
        };

        let et = entry.header().entry_type();
        if et.is_dir() {
            // Pre-existing directories are left untouched
            if !target.exists() {
                if let Err(e) = fs::create_dir_all(&target) {
                    record_failure(&mut stats, logger, &rel, &format!("mkdir: {}", e));
                    continue;
                }
            }
            stats.dirs += 1;
            stats.outcomes.push(EntryOutcome::Transferred {
                path: rel.display().to_string(),
                bytes: 0,
            });
        } else if et.is_file() {
            match write_file_entry(&mut entry, &target) {
                Ok(bytes) => {
                    stats.files += 1;
                    stats.bytes += bytes;
                    stats.outcomes.push(EntryOutcome::Transferred {
                        path: rel.display().to_string(),
                        bytes,
                    });
                }
                Err(e) => {
                    // The unread body is drained when the iterator advances
                    record_failure(&mut stats, logger, &rel, &format!("{:#}", e));
                }
            }
        } else {
            // Symlinks and special entries are outside the catalog model
            let reason = format!("unsupported entry type {:?}", et);
            logger.entry_error("unarchive", &rel, &reason);
            stats.outcomes.push(EntryOutcome::Skipped {
                path: rel.display().to_string(),
                reason,
            });
        }

        if policy.exceeded(stats.failures()) {
            bail!(
                "aborting receive after {} per-entry failures",
                stats.failures()
            );
        }
    }

    Ok(stats)
}

fn record_failure(stats: &mut TransferStats, logger: &dyn Logger, rel: &Path, msg: &str) {
    logger.entry_error("unarchive", rel, msg);
    stats.outcomes.push(EntryOutcome::Failed {
        path: rel.display().to_string(),
        reason: msg.to_string(),
    });
}

fn write_file_entry<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).ok();
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(target)
        .with_context(|| format!("open {}", target.display()))?;
    let bytes = io::copy(entry, &mut file).with_context(|| format!("copy to {}", target.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(mode) = entry.header().mode() {
            let _ = fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777));
        }
    }
    Ok(bytes)
}

/// Join an archive-supplied relative path under `base`, refusing parent
/// components and stripping root/prefix components.
fn join_under(base: &Path, rel: &Path) -> Option<PathBuf> {
    let mut joined = base.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => joined.push(s),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::scan;
    use crate::logger::{MemoryLogger, NoopLogger};
    use std::fs;

    #[test]
    fn round_trip_preserves_content_paths_and_empty_dirs() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::write(src.path().join("a.txt"), b"hello")?;
        fs::create_dir(src.path().join("sub"))?;
        fs::create_dir_all(src.path().join("deep/nested"))?;
        fs::write(src.path().join("deep/nested/b.bin"), vec![7u8; 2000])?;

        let entries = scan(src.path(), true)?;
        let mut wire = Vec::new();
        archive_entries(
            &entries,
            &mut wire,
            src.path(),
            FailurePolicy::default(),
            &NoopLogger,
        )?;

        let stats = unarchive_stream(
            wire.as_slice(),
            dst.path(),
            FailurePolicy::default(),
            &NoopLogger,
        )?;
        assert_eq!(stats.files, 2);
        assert_eq!(
            fs::read(dst.path().join("a.txt"))?,
            b"hello"
        );
        assert_eq!(
            fs::read(dst.path().join("deep/nested/b.bin"))?,
            vec![7u8; 2000]
        );
        assert!(dst.path().join("sub").is_dir());
        Ok(())
    }

    #[test]
    fn unreadable_entry_is_skipped_and_the_rest_delivered() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::write(src.path().join("a.txt"), b"hello")?;

        let mut entries = scan(src.path(), true)?;
        // Catalog drifted: this file vanished between scan and transfer
        entries.push(FileEntry {
            path: "ghost.txt".into(),
            name: "ghost.txt".into(),
            size: 4,
            mode: 0o100644,
            ..Default::default()
        });

        let log = MemoryLogger::default();
        let mut wire = Vec::new();
        let sent = archive_entries(&entries, &mut wire, src.path(), FailurePolicy::default(), &log)?;
        assert_eq!(sent.files, 1);
        assert_eq!(sent.failures(), 1);
        assert!(sent
            .outcomes
            .iter()
            .any(|o| matches!(o, EntryOutcome::Skipped { path, .. } if path == "ghost.txt")));
        assert!(log.lines().iter().any(|l| l.contains("ghost.txt")));

        // The trailer was still written and the receiver is unaffected
        let got = unarchive_stream(wire.as_slice(), dst.path(), FailurePolicy::default(), &NoopLogger)?;
        assert_eq!(got.files, 1);
        assert_eq!(fs::read(dst.path().join("a.txt"))?, b"hello");
        assert!(!dst.path().join("ghost.txt").exists());
        Ok(())
    }

    #[test]
    fn short_source_is_padded_to_the_declared_size() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::write(src.path().join("t.txt"), b"12345")?;
        fs::write(src.path().join("after.txt"), b"ok")?;

        let mut entries = scan(src.path(), true)?;
        // Simulate the file shrinking after the scan
        for e in entries.iter_mut() {
            if e.path == "t.txt" {
                e.size = 10;
            }
        }

        let mut wire = Vec::new();
        let sent = archive_entries(
            &entries,
            &mut wire,
            src.path(),
            FailurePolicy::default(),
            &NoopLogger,
        )?;
        assert!(sent
            .outcomes
            .iter()
            .any(|o| matches!(o, EntryOutcome::Failed { path, .. } if path == "t.txt")));

        let got = unarchive_stream(wire.as_slice(), dst.path(), FailurePolicy::default(), &NoopLogger)?;
        // Framing survived: the padded body has the promised length and the
        // following entry landed intact
        assert_eq!(got.files, 2);
        let padded = fs::read(dst.path().join("t.txt"))?;
        assert_eq!(padded.len(), 10);
        assert_eq!(&padded[..5], b"12345");
        assert!(padded[5..].iter().all(|b| *b == 0));
        assert_eq!(fs::read(dst.path().join("after.txt"))?, b"ok");
        Ok(())
    }

    #[test]
    fn parent_components_never_escape_the_destination() -> Result<()> {
        let dst = tempfile::tempdir()?;
        let inner = dst.path().join("inner");
        fs::create_dir(&inner)?;

        // Hand-build an archive whose entry name climbs out of the root
        let mut wire = Vec::new();
        {
            let mut builder = Builder::new(&mut wire);
            let mut header = Header::new_gnu();
            {
                let name = b"../evil.txt";
                header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
            }
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(4);
            header.set_cksum();
            builder.append(&header, b"pwnd".as_slice())?;
            builder.finish()?;
        }

        let log = MemoryLogger::default();
        let stats = unarchive_stream(wire.as_slice(), &inner, FailurePolicy::default(), &log)?;
        assert_eq!(stats.files, 0);
        assert_eq!(stats.failures(), 1);
        assert!(!dst.path().join("evil.txt").exists());
        assert!(log.lines().iter().any(|l| l.contains("escapes")));
        Ok(())
    }

    #[test]
    fn failure_policy_aborts_the_send() -> Result<()> {
        let src = tempfile::tempdir()?;
        let entries = vec![
            FileEntry {
                path: "ghost1".into(),
                name: "ghost1".into(),
                size: 1,
                mode: 0o100644,
                ..Default::default()
            },
            FileEntry {
                path: "ghost2".into(),
                name: "ghost2".into(),
                size: 1,
                mode: 0o100644,
                ..Default::default()
            },
        ];
        let policy = FailurePolicy {
            max_entry_failures: Some(0),
        };
        let mut wire = Vec::new();
        assert!(archive_entries(&entries, &mut wire, src.path(), policy, &NoopLogger).is_err());
        Ok(())
    }

    #[test]
    fn existing_destination_files_are_overwritten() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::write(src.path().join("a.txt"), b"fresh")?;
        fs::write(dst.path().join("a.txt"), b"stale-and-longer")?;

        let entries = scan(src.path(), true)?;
        let mut wire = Vec::new();
        archive_entries(&entries, &mut wire, src.path(), FailurePolicy::default(), &NoopLogger)?;
        unarchive_stream(wire.as_slice(), dst.path(), FailurePolicy::default(), &NoopLogger)?;
        assert_eq!(fs::read(dst.path().join("a.txt"))?, b"fresh");
        Ok(())
    }
}
