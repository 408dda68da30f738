use std::fmt;

use crate::correlate::CorrelationKey;
use crate::identity::DecodedIdentity;

/// Size of the fixed command-name field (`TASK_COMM_LEN` in the kernel).
pub const COMM_LEN: usize = 16;

/// Upper bound for a captured buffer. The probe copies at most one page.
pub const MAX_BUF_LEN: usize = 4096;

/// Direction of a terminal transfer, relative to the host.
/// Values must match `bpf/include/parrotty.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Bytes sent to a client or terminal.
    Output = 0,
    /// Bytes received from a client or terminal.
    Input = 1,
}

/// Number of Direction variants, used for array sizing.
pub const DIRECTION_CARDINALITY: usize = 2;

impl Direction {
    /// Returns the label used in rendered events.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Input => "INPUT",
        }
    }

    /// Returns the lowercase metric label.
    pub const fn metric_label(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
        }
    }

    /// Convert from the raw `etype` value written by the probe.
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Output),
            1 => Some(Self::Input),
            _ => None,
        }
    }

    /// Return both directions in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::Output, Self::Input]
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel command name of the task that produced an event.
///
/// Opaque NUL-padded bytes: not unique across processes, possibly truncated,
/// and not guaranteed to be valid text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Comm([u8; COMM_LEN]);

impl Comm {
    /// Wrap the raw field as copied out of the kernel.
    pub const fn from_raw(raw: [u8; COMM_LEN]) -> Self {
        Self(raw)
    }

    /// Build from a byte string, truncating to the kernel's 15 usable bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; COMM_LEN];
        let n = bytes.len().min(COMM_LEN - 1);
        raw[..n].copy_from_slice(&bytes[..n]);
        Self(raw)
    }

    /// Bytes up to, not including, the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        &self.0[..end]
    }

    /// The full fixed-size field including padding.
    pub const fn raw(&self) -> &[u8; COMM_LEN] {
        &self.0
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comm({:?})", self.as_bytes())
    }
}

/// One capture record as delivered by the kernel probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventRecord {
    /// Monotonic nanoseconds since boot (`bpf_ktime_get_ns`).
    pub rawtime: u64,
    /// Control group id of the producing task.
    pub cgid: u64,
    /// Inode of the terminal device, or 0 when the probe could not resolve it.
    pub inode: u64,
    /// Packed process and thread id.
    pub pidtgid: u64,
    /// PID namespace inode number.
    pub nsid: u64,
    pub comm: Comm,
    /// Captured bytes. Never decoded as text.
    pub buf: Vec<u8>,
    pub direction: Direction,
}

impl RawEventRecord {
    /// Byte count of `buf`, as reported in the `len` field.
    pub fn len(&self) -> u32 {
        // The probe caps buffers at one page.
        self.buf.len() as u32
    }

    /// Whether no bytes were captured.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// An enriched record emitted by the assembler, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// The record exactly as received.
    pub raw: RawEventRecord,
    /// `pidtgid` split into its halves.
    pub identity: DecodedIdentity,
    /// Estimated wall-clock time in nanoseconds since the Unix epoch.
    pub wall_time_ns: u64,
}

impl EventRecord {
    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    pub fn tgid(&self) -> u32 {
        self.identity.tgid
    }

    pub fn direction(&self) -> Direction {
        self.raw.direction
    }

    pub fn len(&self) -> u32 {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Identity fields for session reconstruction by an external consumer.
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::from_record(&self.raw)
    }
}
