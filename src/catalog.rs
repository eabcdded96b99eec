//! Catalog scanning: enumerate a directory tree into wire-ready entries

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// Unix-style file type bits carried in `FileEntry::mode`
pub const MODE_TYPE_MASK: u32 = 0o170000;
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_REG: u32 = 0o100000;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// One catalog record: a file or directory under the synchronized root.
///
/// Field names match the wire schema. Every field is omitted when
/// zero/empty on encode and defaulted when missing on decode, so a peer
/// may legally send objects with any subset of fields present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Modification time, carried for diagnostics; never part of equality
    #[serde(rename = "time", default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    /// Lowercase hex MD5 of the full body; empty for directories and
    /// whenever hashing was disabled for the scan
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    /// Final path segment, kept for archive header convenience
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Slash-separated path relative to the synchronized root; unique key
    /// within one catalog
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// `st_mode`-style bits: file type plus permissions
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mode: u32,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }

    /// Permission bits without the file type
    pub fn perm_bits(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Walk `root` and build a catalog of everything under it.
///
/// The root itself is visited (an unwalkable root fails the scan) but is
/// not cataloged; entries are keyed by their root-relative path, and the
/// root's own relative path is empty. Entry order is walk order - callers
/// must not depend on it.
///
/// Any walk or hashing failure is fatal to the whole scan: a silently
/// skipped hash would be indistinguishable from "unchanged" on the peer.
pub fn scan(root: &Path, checksum: bool) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for item in WalkDir::new(root).follow_links(false) {
        let item = item.with_context(|| format!("walk {}", root.display()))?;
        let ft = item.file_type();
        // Symlinks and special files are outside the catalog model
        if !ft.is_dir() && !ft.is_file() {
            continue;
        }
        let rel = item.path().strip_prefix(root).unwrap_or(item.path());
        let rel = slash_path(rel);
        if rel.is_empty() {
            continue;
        }
        if !seen.insert(rel.clone()) {
            bail!("duplicate path in scan of {}: {}", root.display(), rel);
        }
        let meta = item
            .metadata()
            .with_context(|| format!("stat {}", item.path().display()))?;
        let hash = if checksum && ft.is_file() {
            hash_file(item.path())?
        } else {
            String::new()
        };
        entries.push(FileEntry {
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            hash,
            size: meta.len(),
            name: item.file_name().to_string_lossy().into_owned(),
            path: rel,
            mode: mode_bits(&meta),
        });
    }

    Ok(entries)
}

/// Stream a file through MD5, returning the lowercase hex digest.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; HASH_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn slash_path(rel: &Path) -> String {
    let s = rel.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        MODE_DIR | 0o755
    } else {
        MODE_REG | 0o644
    }
}
