//! Client-side readers for the two served protocols.

use anyhow::{bail, Context, Result};
use std::io::{ErrorKind, Read};

/// Upper bound accepted for one snapshot payload.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Read one `[u32 BE length][payload]` snapshot frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_snapshot_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => bail!("snapshot stream ended inside a length prefix"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read snapshot length"),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_SNAPSHOT_BYTES {
        bail!("snapshot length {} exceeds {} bytes", len, MAX_SNAPSHOT_BYTES);
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .context("read snapshot payload")?;
    Ok(Some(payload))
}

/// Split start-code delimited bytes into unit payloads (start codes removed).
///
/// Bytes before the first start code are ignored; empty units are skipped.
pub fn split_units(buf: &[u8]) -> Vec<&[u8]> {
    let codes = start_codes(buf);
    let mut units = Vec::with_capacity(codes.len());
    for (i, &(_, payload)) in codes.iter().enumerate() {
        let end = codes.get(i + 1).map_or(buf.len(), |&(start, _)| start);
        if payload < end {
            units.push(&buf[payload..end]);
        }
    }
    units
}

/// Incremental splitter for a compressed stream read in arbitrary chunks.
///
/// A unit is complete once the next start code has been seen.
#[derive(Debug, Default)]
pub struct UnitScanner {
    pending: Vec<u8>,
}

impl UnitScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every unit completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let Some(&(last, _)) = start_codes(&self.pending).last() else {
            return Vec::new();
        };
        let complete: Vec<Vec<u8>> = split_units(&self.pending[..last])
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..last);
        complete
    }

    /// Flush the unit still being accumulated at end of stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let pending = std::mem::take(&mut self.pending);
        split_units(&pending).last().map(|unit| unit.to_vec())
    }
}

/// `(marker start, payload start)` of every start code, 3- or 4-byte.
fn start_codes(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut codes = Vec::new();
    let mut i = 0;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            let start = if i > 0 && buf[i - 1] == 0 { i - 1 } else { i };
            codes.push((start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    codes
}
