//! Decoding of raw BPF ring buffer samples.
//!
//! Turns byte slices from the ring buffer into [`RawEventRecord`] values. The
//! record length is checked once at entry: a sample of any other size means
//! the probe object and this parser disagree on the layout.

use thiserror::Error;

use super::event::{Comm, Direction, RawEventRecord, COMM_LEN, MAX_BUF_LEN};

// Field offsets of `struct tty_event` in `bpf/include/parrotty.h`.
const RAWTIME_OFFSET: usize = 0;
const CGID_OFFSET: usize = 8;
const INODE_OFFSET: usize = 16;
const PIDTGID_OFFSET: usize = 24;
const NSID_OFFSET: usize = 32;
const COMM_OFFSET: usize = 40;
const BUF_OFFSET: usize = COMM_OFFSET + COMM_LEN;
const LEN_OFFSET: usize = BUF_OFFSET + MAX_BUF_LEN;
const DIRECTION_OFFSET: usize = LEN_OFFSET + 4;

/// Size in bytes of one record as submitted by the probe.
pub const RECORD_SIZE: usize = DIRECTION_OFFSET + 4;

/// Errors that can occur while decoding a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("record size mismatch: {size} bytes, expected {RECORD_SIZE}")]
    SizeMismatch { size: usize },

    #[error("record length field {len} exceeds buffer capacity {MAX_BUF_LEN}")]
    LengthOverflow { len: u32 },

    #[error("invalid direction value {raw}")]
    InvalidDirection { raw: i32 },
}

impl ParseError {
    /// Short label for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::LengthOverflow { .. } => "length_overflow",
            Self::InvalidDirection { .. } => "invalid_direction",
        }
    }
}

/// Parse a raw ring buffer sample into a [`RawEventRecord`].
///
/// Only the first `len` bytes of the captured buffer are kept; the remainder of
/// the page is probe scratch space.
pub fn parse_record(data: &[u8]) -> Result<RawEventRecord, ParseError> {
    if data.len() != RECORD_SIZE {
        return Err(ParseError::SizeMismatch { size: data.len() });
    }

    let len = read_u32_le(data, LEN_OFFSET);
    let len_usize = len as usize;
    if len_usize > MAX_BUF_LEN {
        return Err(ParseError::LengthOverflow { len });
    }

    let direction_raw = read_i32_le(data, DIRECTION_OFFSET);
    let direction = Direction::from_raw(direction_raw).ok_or(ParseError::InvalidDirection {
        raw: direction_raw,
    })?;

    let buf = data
        .get(BUF_OFFSET..BUF_OFFSET + len_usize)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();

    Ok(RawEventRecord {
        rawtime: read_u64_le(data, RAWTIME_OFFSET),
        cgid: read_u64_le(data, CGID_OFFSET),
        inode: read_u64_le(data, INODE_OFFSET),
        pidtgid: read_u64_le(data, PIDTGID_OFFSET),
        nsid: read_u64_le(data, NSID_OFFSET),
        comm: Comm::from_raw(read_fixed::<COMM_LEN>(data, COMM_OFFSET)),
        buf,
        direction,
    })
}

/// Encode a record into the probe's wire layout.
///
/// The inverse of [`parse_record`]; userland producers use it to feed records
/// through the same path as the kernel probe. A `buf` longer than the wire
/// field is rejected rather than cut.
pub fn encode_record(record: &RawEventRecord) -> Result<Vec<u8>, ParseError> {
    if record.buf.len() > MAX_BUF_LEN {
        return Err(ParseError::LengthOverflow {
            len: u32::try_from(record.buf.len()).unwrap_or(u32::MAX),
        });
    }

    let mut out = vec![0u8; RECORD_SIZE];
    write_bytes(&mut out, RAWTIME_OFFSET, &record.rawtime.to_le_bytes());
    write_bytes(&mut out, CGID_OFFSET, &record.cgid.to_le_bytes());
    write_bytes(&mut out, INODE_OFFSET, &record.inode.to_le_bytes());
    write_bytes(&mut out, PIDTGID_OFFSET, &record.pidtgid.to_le_bytes());
    write_bytes(&mut out, NSID_OFFSET, &record.nsid.to_le_bytes());
    write_bytes(&mut out, COMM_OFFSET, record.comm.raw());

    write_bytes(&mut out, BUF_OFFSET, &record.buf);
    write_bytes(&mut out, LEN_OFFSET, &(record.buf.len() as u32).to_le_bytes());
    write_bytes(
        &mut out,
        DIRECTION_OFFSET,
        &i32::from(record.direction as u8).to_le_bytes(),
    );
    Ok(out)
}

// ---------------------------------------------------------------------------
// Byte-reading helpers (no indexing, no panics)
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

fn write_bytes(out: &mut [u8], offset: usize, bytes: &[u8]) {
    if let Some(dst) = out.get_mut(offset..offset + bytes.len()) {
        dst.copy_from_slice(bytes);
    }
}
