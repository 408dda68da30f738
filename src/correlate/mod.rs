//! Correlation keys handed to external session-reconstruction logic.
//!
//! Nothing in this crate merges events into sessions. A key only packages the
//! identity fields of one record. Consumers must expect that:
//!
//! - `inode` can be unavailable (reported as 0 by the probe), and
//! - records that belong to one logical session can carry different inodes,
//!   e.g. one user logged in on two terminals at once.
//!
//! `comm` is part of the key but is neither unique nor reliable on its own.

use crate::tracer::event::{Comm, RawEventRecord};

/// Read-only identity tuple `(cgid, inode, pidtgid, nsid, comm)` of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    cgid: u64,
    inode: u64,
    pidtgid: u64,
    nsid: u64,
    comm: Comm,
}

impl CorrelationKey {
    /// Copy the identity fields out of a record.
    pub fn from_record(record: &RawEventRecord) -> Self {
        Self {
            cgid: record.cgid,
            inode: record.inode,
            pidtgid: record.pidtgid,
            nsid: record.nsid,
            comm: record.comm,
        }
    }

    pub fn cgid(&self) -> u64 {
        self.cgid
    }

    /// Terminal inode, or `None` when the probe could not resolve one.
    pub fn inode(&self) -> Option<u64> {
        (self.inode != 0).then_some(self.inode)
    }

    pub fn pidtgid(&self) -> u64 {
        self.pidtgid
    }

    pub fn nsid(&self) -> u64 {
        self.nsid
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// The key as a plain tuple, with the raw inode value.
    pub fn as_tuple(&self) -> (u64, u64, u64, u64, Comm) {
        (self.cgid, self.inode, self.pidtgid, self.nsid, self.comm)
    }
}
