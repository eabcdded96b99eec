//! Catalog exchange: the wire procedure that precedes any file payload
//!
//! The announcing side writes a fixed preamble (magic + version), a 4-byte
//! big-endian entry count, and its catalog as exactly one JSON array. The
//! receiving side validates the preamble and decodes exactly one JSON value
//! from the stream continuation, leaving the byte after the closing bracket
//! for the archive phase - there is no other framing boundary between the
//! two phases.

use crate::catalog::FileEntry;
use crate::protocol::{MAGIC, MAX_CATALOG_BYTES, VERSION};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::{Read, Write};

/// Announce a catalog to the peer.
pub fn send_catalog<W: Write>(stream: &mut W, entries: &[FileEntry]) -> Result<()> {
    let body = serde_json::to_vec(entries).context("encode catalog json")?;
    if body.len() as u64 > MAX_CATALOG_BYTES {
        bail!(
            "catalog encoding is {} bytes, over the {} byte ceiling",
            body.len(),
            MAX_CATALOG_BYTES
        );
    }
    let mut preamble = Vec::with_capacity(10);
    preamble.extend_from_slice(MAGIC);
    preamble.extend_from_slice(&VERSION.to_be_bytes());
    preamble.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    stream.write_all(&preamble).context("write handshake preamble")?;
    stream.write_all(&body).context("write catalog json")?;
    Ok(())
}

/// Receive the peer's catalog announcement.
///
/// Returns the announced count alongside the decoded entries. The count is
/// a hint and a diagnostic input only - the JSON decode result is
/// authoritative for the catalog contents.
pub fn recv_catalog<R: Read>(stream: &mut R) -> Result<(u32, Vec<FileEntry>)> {
    recv_catalog_limited(stream, MAX_CATALOG_BYTES)
}

fn recv_catalog_limited<R: Read>(stream: &mut R, max_bytes: u64) -> Result<(u32, Vec<FileEntry>)> {
    let mut preamble = [0u8; 10];
    stream
        .read_exact(&mut preamble)
        .context("read handshake preamble")?;
    if &preamble[0..4] != MAGIC {
        bail!("bad handshake magic {:02x?}", &preamble[0..4]);
    }
    let version = u16::from_be_bytes([preamble[4], preamble[5]]);
    if version != VERSION {
        bail!("unsupported protocol version {} (expected {})", version, VERSION);
    }
    let count = u32::from_be_bytes([preamble[6], preamble[7], preamble[8], preamble[9]]);

    // The decoder consumes exactly one JSON value; whatever follows it is
    // the archive stream and must be left untouched.
    let mut limited = stream.by_ref().take(max_bytes);
    let mut de = serde_json::Deserializer::from_reader(&mut limited);
    let entries = Vec::<FileEntry>::deserialize(&mut de)
        .with_context(|| format!("decode catalog json (announced count {})", count))?;
    Ok((count, entries))
}
