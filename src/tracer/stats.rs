use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{Direction, DIRECTION_CARDINALITY};

/// Lock-free per-direction event and byte counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    events: [AtomicU64; DIRECTION_CARDINALITY],
    bytes: [AtomicU64; DIRECTION_CARDINALITY],
}

/// Counts accumulated for one direction since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionCount {
    pub direction: Direction,
    pub events: u64,
    pub bytes: u64,
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            events: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one event carrying `len` bytes.
    pub fn record(&self, d: Direction, len: u32) {
        if let Some(counter) = self.events.get(d as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(counter) = self.bytes.get(d as usize) {
            counter.fetch_add(u64::from(len), Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only directions that saw events.
    pub fn snapshot(&self) -> Vec<DirectionCount> {
        let mut result = Vec::with_capacity(DIRECTION_CARDINALITY);

        for direction in Direction::all() {
            let i = *direction as usize;
            let events = self
                .events
                .get(i)
                .map_or(0, |c| c.swap(0, Ordering::Relaxed));
            let bytes = self
                .bytes
                .get(i)
                .map_or(0, |c| c.swap(0, Ordering::Relaxed));
            if events > 0 {
                result.push(DirectionCount {
                    direction: *direction,
                    events,
                    bytes,
                });
            }
        }

        result
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EventStats::new();
        stats.record(Direction::Input, 1);
        stats.record(Direction::Input, 1);
        stats.record(Direction::Output, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let input = snap
            .iter()
            .find(|c| c.direction == Direction::Input)
            .copied();
        assert_eq!(
            input,
            Some(DirectionCount {
                direction: Direction::Input,
                events: 2,
                bytes: 2,
            })
        );

        let output = snap.iter().find(|c| c.direction == Direction::Output);
        assert_eq!(output.map(|c| (c.events, c.bytes)), Some((1, 3)));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EventStats::new();
        stats.record(Direction::Output, 10);

        let snap1 = stats.snapshot();
        assert_eq!(snap1.len(), 1);

        let snap2 = stats.snapshot();
        assert!(snap2.is_empty());
    }

    #[test]
    fn test_empty_buffers_still_count_events() {
        let stats = EventStats::new();
        stats.record(Direction::Input, 0);
        let snap = stats.snapshot();
        assert_eq!(snap.first().map(|c| (c.events, c.bytes)), Some((1, 0)));
    }
}
