//! Bitstream re-framing.
//!
//! Encoders hand out compressed output in one of two conventions:
//! - start-code delimited (`00 00 00 01` or `00 00 01` before every unit)
//! - 4-byte big-endian length prefix before every unit
//!
//! The compressed stream served to viewers is always start-code delimited.
//! Everything here is a pure function over byte slices.

use anyhow::{anyhow, Result};
use std::borrow::Cow;

/// Marker written before every unit on the compressed stream.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const SHORT_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const LENGTH_PREFIX_BYTES: usize = 4;

/// Output of normalizing one encoder buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Normalized<'a> {
    /// Start-code delimited bytes, borrowed when the input was already normalized.
    pub bytes: Cow<'a, [u8]>,
    /// Number of units emitted (0 when passed through verbatim).
    pub units: usize,
    /// Trailing bytes discarded after a malformed length prefix.
    pub dropped: usize,
}

impl Normalized<'_> {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// True when `buf` already begins with a 4- or 3-byte start code.
pub fn has_start_code(buf: &[u8]) -> bool {
    buf.starts_with(&START_CODE) || buf.starts_with(&SHORT_START_CODE)
}

/// Normalize one encoder output buffer to start-code framing.
///
/// Length-prefixed input is walked unit by unit. A prefix of zero, a prefix
/// larger than what is left, or fewer than four bytes remaining ends the walk;
/// the rest of the buffer is dropped rather than reported as an error.
pub fn normalize_access_unit(buf: &[u8]) -> Normalized<'_> {
    if has_start_code(buf) {
        return Normalized {
            bytes: Cow::Borrowed(buf),
            units: 0,
            dropped: 0,
        };
    }

    let mut out = Vec::with_capacity(buf.len() + LENGTH_PREFIX_BYTES);
    let mut units = 0;
    let mut offset = 0;
    while offset < buf.len() {
        let Some(len) = read_length_prefix(&buf[offset..]) else {
            break;
        };
        let start = offset + LENGTH_PREFIX_BYTES;
        let remaining = buf.len() - start;
        if len == 0 || len > remaining {
            break;
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&buf[start..start + len]);
        units += 1;
        offset = start + len;
    }

    Normalized {
        bytes: Cow::Owned(out),
        units,
        dropped: buf.len() - offset,
    }
}

/// Concatenate decoder configuration units into one start-code delimited blob.
///
/// Units that already carry a start code are kept verbatim; bare units get a
/// marker prepended. Empty units are skipped.
pub fn normalize_config<T: AsRef<[u8]>>(units: &[T]) -> Vec<u8> {
    let total: usize = units
        .iter()
        .map(|unit| unit.as_ref().len() + START_CODE.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for unit in units.iter().map(AsRef::as_ref) {
        if unit.is_empty() {
            continue;
        }
        if !has_start_code(unit) {
            out.extend_from_slice(&START_CODE);
        }
        out.extend_from_slice(unit);
    }
    out
}

/// Split an AVC decoder configuration record (`avcC`) into its SPS and PPS
/// units, in record order.
pub fn parse_avc_config(record: &[u8]) -> Result<Vec<Vec<u8>>> {
    if record.len() < 7 {
        return Err(anyhow!("avcC record too short ({} bytes)", record.len()));
    }
    if record[0] != 1 {
        return Err(anyhow!("unsupported avcC version {}", record[0]));
    }

    let mut units = Vec::new();
    let mut pos = 5;
    let sps_count = (record[pos] & 0x1F) as usize;
    pos += 1;
    pos = read_avc_units(record, pos, sps_count, &mut units)?;
    let pps_count = *record
        .get(pos)
        .ok_or_else(|| anyhow!("avcC record missing PPS count"))? as usize;
    read_avc_units(record, pos + 1, pps_count, &mut units)?;
    Ok(units)
}

fn read_avc_units(
    record: &[u8],
    mut pos: usize,
    count: usize,
    units: &mut Vec<Vec<u8>>,
) -> Result<usize> {
    for _ in 0..count {
        let len_bytes = record
            .get(pos..pos + 2)
            .ok_or_else(|| anyhow!("avcC parameter set length truncated"))?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        pos += 2;
        let unit = record
            .get(pos..pos + len)
            .ok_or_else(|| anyhow!("avcC parameter set truncated"))?;
        units.push(unit.to_vec());
        pos += len;
    }
    Ok(pos)
}

fn read_length_prefix(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_BYTES] = buf.get(..LENGTH_PREFIX_BYTES)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_prefixed(units: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn zero_length_unit_ends_the_walk() {
        // Sizes [5, 10, 0, 7]: the zero-length prefix stops processing.
        let mut buf = length_prefixed(&[vec![0xA1; 5], vec![0xB2; 10]]);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&[0xC3; 7]);

        let out = normalize_access_unit(&buf);
        assert_eq!(out.units, 2);
        assert_eq!(out.dropped, 15);

        let mut expected = START_CODE.to_vec();
        expected.extend_from_slice(&[0xA1; 5]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&[0xB2; 10]);
        assert_eq!(out.bytes.as_ref(), expected.as_slice());
    }

    #[test]
    fn start_code_input_passes_through_unchanged() {
        let buf = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00];
        let out = normalize_access_unit(&buf);
        assert!(matches!(out.bytes, Cow::Borrowed(_)));
        assert_eq!(out.bytes.as_ref(), &buf);
        assert_eq!(out.dropped, 0);

        let short = [0x00, 0x00, 0x01, 0x41, 0x9a];
        assert_eq!(normalize_access_unit(&short).bytes.as_ref(), &short);
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let buf = length_prefixed(&[vec![0x67, 1, 2], vec![0x68, 3]]);
        let once = normalize_access_unit(&buf).bytes.into_owned();
        let twice = normalize_access_unit(&once);
        assert_eq!(twice.bytes.as_ref(), once.as_slice());
    }

    #[test]
    fn oversized_length_drops_the_remainder() {
        let mut buf = length_prefixed(&[vec![0x41; 3]]);
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[0x42; 6]);

        let out = normalize_access_unit(&buf);
        assert_eq!(out.units, 1);
        assert_eq!(out.dropped, 10);
        assert_eq!(out.bytes.len(), START_CODE.len() + 3);
    }

    #[test]
    fn truncated_prefix_is_dropped() {
        let mut buf = length_prefixed(&[vec![0x41; 2]]);
        buf.extend_from_slice(&[0x00, 0x00]);

        let out = normalize_access_unit(&buf);
        assert_eq!(out.units, 1);
        assert_eq!(out.dropped, 2);
    }

    #[test]
    fn config_units_get_markers_only_when_missing() {
        let sps = vec![0x67, 0x42, 0x00, 0x1f];
        let pps = [START_CODE.to_vec(), vec![0x68, 0xce]].concat();

        let blob = normalize_config(&[sps.clone(), pps.clone()]);
        let expected = [START_CODE.to_vec(), sps, pps].concat();
        assert_eq!(blob, expected);
    }

    #[test]
    fn avc_config_record_yields_sps_then_pps() -> Result<()> {
        let record = [
            0x01, 0x42, 0xC0, 0x1F, 0xFF, // version, profile, compat, level, length size
            0xE1, 0x00, 0x03, 0x67, 0x42, 0x1F, // one SPS
            0x01, 0x00, 0x02, 0x68, 0xCE, // one PPS
        ];
        let units = parse_avc_config(&record)?;
        assert_eq!(units, vec![vec![0x67, 0x42, 0x1F], vec![0x68, 0xCE]]);
        Ok(())
    }

    #[test]
    fn truncated_avc_config_is_rejected() {
        let record = [0x01, 0x42, 0xC0, 0x1F, 0xFF, 0xE1, 0x00, 0x09, 0x67];
        assert!(parse_avc_config(&record).is_err());
        assert!(parse_avc_config(&[0x00; 7]).is_err());
    }

    #[test]
    fn empty_config_units_are_skipped() {
        let blob = normalize_config(&[Vec::new(), vec![0x67]]);
        assert_eq!(blob, vec![0, 0, 0, 1, 0x67]);
        assert!(normalize_config::<Vec<u8>>(&[]).is_empty());
    }
}
