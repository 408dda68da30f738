//! In-process bounded source with lossy producers.
//!
//! Mirrors the kernel ring buffer contract in userland: any number of producer
//! handles submit without blocking, a full buffer drops the new record and
//! counts it, and a single [`ChannelSource`] drains in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use super::event::RawEventRecord;
use super::{EventSource, SourceError};

/// Why a submission did not enter the buffer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("event buffer full, record dropped")]
    Full,

    #[error("event consumer closed")]
    Closed,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct ChannelProducer {
    tx: mpsc::Sender<RawEventRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelProducer {
    /// Submit one record without waiting for capacity.
    pub fn submit(&self, record: RawEventRecord) -> Result<(), SubmitError> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Records dropped by all handles so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single-consumer end of a bounded record buffer.
pub struct ChannelSource {
    rx: mpsc::Receiver<RawEventRecord>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl ChannelSource {
    /// Create a buffer holding at most `capacity` records (minimum 1).
    pub fn bounded(capacity: usize) -> (ChannelProducer, Self) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        (
            ChannelProducer {
                tx,
                dropped: Arc::clone(&dropped),
            },
            Self {
                rx,
                dropped,
                capacity,
            },
        )
    }

    /// Maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn recv(&mut self) -> Result<RawEventRecord, SourceError> {
        self.rx.recv().await.ok_or(SourceError::ProducerTerminated)
    }

    fn dropped(&self) -> Option<u64> {
        Some(self.dropped.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{Comm, Direction};

    fn record(rawtime: u64) -> RawEventRecord {
        RawEventRecord {
            rawtime,
            cgid: 1,
            inode: 2,
            pidtgid: 3,
            nsid: 4,
            comm: Comm::from_bytes(b"bash"),
            buf: b"x".to_vec(),
            direction: Direction::Output,
        }
    }

    #[tokio::test]
    async fn test_delivers_in_arrival_order() {
        let (producer, mut source) = ChannelSource::bounded(8);
        for t in [30, 10, 20] {
            producer.submit(record(t)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(source.recv().await.unwrap().rawtime);
        }
        assert_eq!(seen, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let (producer, mut source) = ChannelSource::bounded(2);
        assert!(producer.submit(record(1)).is_ok());
        assert!(producer.submit(record(2)).is_ok());
        assert_eq!(producer.submit(record(3)), Err(SubmitError::Full));
        assert_eq!(producer.submit(record(4)), Err(SubmitError::Full));

        assert_eq!(source.dropped(), Some(2));
        assert_eq!(producer.dropped(), 2);

        // Retained slots are still delivered.
        assert_eq!(source.recv().await.unwrap().rawtime, 1);
        assert_eq!(source.recv().await.unwrap().rawtime, 2);
    }

    #[tokio::test]
    async fn test_clones_share_drop_counter() {
        let (producer, source) = ChannelSource::bounded(1);
        let other = producer.clone();
        producer.submit(record(1)).unwrap();
        assert_eq!(other.submit(record(2)), Err(SubmitError::Full));
        assert_eq!(source.dropped(), Some(1));
    }

    #[tokio::test]
    async fn test_all_producers_gone_is_an_error() {
        let (producer, mut source) = ChannelSource::bounded(4);
        producer.submit(record(1)).unwrap();
        drop(producer);

        assert!(source.recv().await.is_ok());
        let err = source.recv().await.unwrap_err();
        assert!(matches!(err, SourceError::ProducerTerminated));
        assert_eq!(err.kind(), "producer_terminated");
    }

    #[tokio::test]
    async fn test_submit_after_consumer_closed() {
        let (producer, source) = ChannelSource::bounded(4);
        drop(source);
        assert_eq!(producer.submit(record(1)), Err(SubmitError::Closed));
        assert_eq!(producer.dropped(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (_producer, source) = ChannelSource::bounded(0);
        assert_eq!(source.capacity(), 1);
    }
}
