//! Decoding of the packed `pid_tgid` identifier reported by the kernel probe.
//!
//! The probe stores `bpf_get_current_pid_tgid()` verbatim: the upper half holds
//! the process id and the lower half the thread (group) id as seen by the kernel.

use std::fmt;

/// Bit offset of the process id inside a packed identifier.
pub const PID_SHIFT: u32 = 32;

/// Mask selecting the thread id inside a packed identifier.
pub const TGID_MASK: u64 = 0xFFFF_FFFF;

/// The two 32-bit process identifiers carried by one packed `pid_tgid` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedIdentity {
    /// Upper 32 bits.
    pub pid: u32,
    /// Lower 32 bits.
    pub tgid: u32,
}

impl DecodedIdentity {
    /// Split a packed identifier into its two halves.
    #[inline]
    pub const fn decode(pidtgid: u64) -> Self {
        Self {
            pid: (pidtgid >> PID_SHIFT) as u32,
            tgid: (pidtgid & TGID_MASK) as u32,
        }
    }

    /// Re-pack the identity into the kernel's 64-bit layout.
    #[inline]
    pub const fn packed(self) -> u64 {
        ((self.pid as u64) << PID_SHIFT) | self.tgid as u64
    }
}

impl From<u64> for DecodedIdentity {
    fn from(pidtgid: u64) -> Self {
        Self::decode(pidtgid)
    }
}

impl fmt::Display for DecodedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} tid={}", self.pid, self.tgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_value() {
        let id = DecodedIdentity::decode(11_076_720_658_963);
        assert_eq!(id.pid, 2579);
        assert_eq!(id.tgid, 2579);
    }

    #[test]
    fn test_decode_distinct_halves() {
        let packed = (4_242u64 << 32) | 17;
        let id = DecodedIdentity::decode(packed);
        assert_eq!(id.pid, 4_242);
        assert_eq!(id.tgid, 17);
    }

    #[test]
    fn test_decode_extremes() {
        assert_eq!(
            DecodedIdentity::decode(0),
            DecodedIdentity { pid: 0, tgid: 0 }
        );
        assert_eq!(
            DecodedIdentity::decode(u64::MAX),
            DecodedIdentity {
                pid: u32::MAX,
                tgid: u32::MAX
            }
        );
        assert_eq!(
            DecodedIdentity::decode(TGID_MASK),
            DecodedIdentity {
                pid: 0,
                tgid: u32::MAX
            }
        );
    }

    #[test]
    fn test_decode_matches_shift_and_mask() {
        for v in [
            1u64,
            0xDEAD_BEEF_0000_0001,
            0x0000_0001_FFFF_FFFF,
            0x8000_0000_8000_0000,
            11_076_720_658_963,
        ] {
            let id = DecodedIdentity::decode(v);
            assert_eq!(u64::from(id.pid), v >> 32, "pid of {v:#x}");
            assert_eq!(u64::from(id.tgid), v & 0xFFFF_FFFF, "tgid of {v:#x}");
            assert_eq!(id.packed(), v);
        }
    }

    #[test]
    fn test_display() {
        let id = DecodedIdentity { pid: 10, tgid: 11 };
        assert_eq!(id.to_string(), "pid=10 tid=11");
    }
}
