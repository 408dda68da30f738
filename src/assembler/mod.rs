//! Turns raw capture records into calibrated, decoded events and dispatches
//! them to a sink, one at a time, in arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Calibrator, SystemWallClock, WallClock};
use crate::export::health::HealthMetrics;
use crate::identity::DecodedIdentity;
use crate::sink::{EventSink, SinkError};
use crate::tracer::event::{EventRecord, RawEventRecord};
use crate::tracer::stats::EventStats;
use crate::tracer::{EventSource, SourceError};

/// Events between reads of the source's drop counter.
pub const DROP_POLL_INTERVAL: u64 = 1000;

/// Longest an idle loop waits before reading the drop counter.
pub const DROP_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Why the dispatch loop stopped early.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("event source failed")]
    Source(#[from] SourceError),

    #[error("event sink failed")]
    Sink(#[from] SinkError),
}

/// Totals for a completed dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Events delivered to the sink.
    pub events: u64,
    /// Drift- or age-triggered recalibrations.
    pub recalibrations: u64,
    /// Last value of the source's drop counter, if it has one.
    pub dropped: Option<u64>,
}

/// Single-reader event assembler. Owns the calibration state.
pub struct Assembler<C: WallClock = SystemWallClock> {
    calibrator: Calibrator<C>,
    metrics: Option<Arc<HealthMetrics>>,
    stats: Option<Arc<EventStats>>,
    last_dropped: u64,
    drop_poll_period: Duration,
}

impl Assembler<SystemWallClock> {
    pub fn new() -> Self {
        Self::with_calibrator(Calibrator::new())
    }
}

impl Default for Assembler<SystemWallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: WallClock> Assembler<C> {
    pub fn with_calibrator(calibrator: Calibrator<C>) -> Self {
        Self {
            calibrator,
            metrics: None,
            stats: None,
            last_dropped: 0,
            drop_poll_period: DROP_POLL_PERIOD,
        }
    }

    /// Report received events, recalibrations and drops to Prometheus.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accumulate per-direction counts for periodic reporting.
    pub fn with_stats(mut self, stats: Arc<EventStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Read the drop counter at least this often while waiting for records.
    pub fn with_drop_poll_period(mut self, period: Duration) -> Self {
        self.drop_poll_period = period;
        self
    }

    pub fn calibrator(&self) -> &Calibrator<C> {
        &self.calibrator
    }

    /// Enrich one raw record. Every field of `raw` is carried through unchanged.
    pub fn assemble(&mut self, raw: RawEventRecord) -> EventRecord {
        let was_calibrated = self.calibrator.is_calibrated();
        let calibration = self.calibrator.calibrate_traced(raw.rawtime);

        if let Some(metrics) = &self.metrics {
            metrics.observe_event(raw.direction);
            if was_calibrated {
                metrics.clock_drift.observe(calibration.drift_ns as f64);
            }
            if let Some(reason) = calibration.recalibration {
                metrics.observe_recalibration(reason);
            }
        }

        if let Some(stats) = &self.stats {
            stats.record(raw.direction, raw.len());
        }

        EventRecord {
            identity: DecodedIdentity::decode(raw.pidtgid),
            wall_time_ns: calibration.wall_time_ns,
            raw,
        }
    }

    /// Pull, enrich and dispatch until cancelled.
    ///
    /// Each event is handed to the sink before the next record is read. A
    /// source or sink failure, including the producer going away, stops the
    /// loop and is returned; nothing is retried. The source's drop counter is
    /// read every [`DROP_POLL_INTERVAL`] events and at least every poll period.
    pub async fn run<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AssembleError>
    where
        S: EventSource,
        K: EventSink + ?Sized,
    {
        info!(source = source.name(), sink = sink.name(), "event loop started");
        let mut events: u64 = 0;

        let mut drop_poll = tokio::time::interval(self.drop_poll_period);
        drop_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("event loop cancelled");
                    break;
                }
                _ = drop_poll.tick() => {
                    self.poll_dropped(source);
                    continue;
                }
                result = source.recv() => match result {
                    Ok(raw) => raw,
                    Err(e) => {
                        error!(source = source.name(), kind = e.kind(), error = %e, "event source failed");
                        self.poll_dropped(source);
                        if let Err(flush_err) = sink.flush() {
                            warn!(error = %flush_err, "flushing sink after source failure");
                        }
                        return Err(e.into());
                    }
                },
            };

            let started = Instant::now();
            let event = self.assemble(raw);
            if let Err(e) = sink.handle_event(&event) {
                error!(sink = sink.name(), error = %e, "event sink failed");
                return Err(e.into());
            }
            if let Some(metrics) = &self.metrics {
                metrics
                    .event_processing_duration
                    .observe(started.elapsed().as_secs_f64());
            }

            events += 1;
            if events % DROP_POLL_INTERVAL == 0 {
                self.poll_dropped(source);
            }
        }

        self.poll_dropped(source);
        sink.flush()?;

        let summary = RunSummary {
            events,
            recalibrations: self.calibrator.recalibrations(),
            dropped: source.dropped(),
        };
        info!(
            events = summary.events,
            recalibrations = summary.recalibrations,
            dropped = ?summary.dropped,
            "event loop stopped"
        );

        Ok(summary)
    }

    /// Surface growth of the source's drop counter.
    fn poll_dropped<S: EventSource>(&mut self, source: &S) {
        let Some(dropped) = source.dropped() else {
            return;
        };
        if dropped <= self.last_dropped {
            return;
        }

        let delta = dropped - self.last_dropped;
        self.last_dropped = dropped;
        warn!(delta, total = dropped, "events dropped at full ring buffer");
        if let Some(metrics) = &self.metrics {
            metrics.events_dropped.inc_by(delta as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualWallClock;
    use crate::tracer::event::{Comm, Direction};
    use crate::tracer::parse::ParseError;
    use crate::tracer::source::ChannelSource;

    const EPOCH_NS: u64 = 1_700_000_000_000_000_000;

    fn raw(rawtime: u64, buf: &[u8], direction: Direction) -> RawEventRecord {
        RawEventRecord {
            rawtime,
            cgid: 4_294_967_297,
            inode: 3,
            pidtgid: 11_076_720_658_963,
            nsid: 4_026_531_836,
            comm: Comm::from_bytes(b"bash"),
            buf: buf.to_vec(),
            direction,
        }
    }

    fn assembler() -> (ManualWallClock, Assembler<ManualWallClock>) {
        let clock = ManualWallClock::new(EPOCH_NS);
        let asm = Assembler::with_calibrator(Calibrator::with_clock(clock.clone()));
        (clock, asm)
    }

    /// Collects events in memory.
    #[derive(Default)]
    struct VecSink {
        events: Vec<EventRecord>,
        flushes: usize,
        fail_after: Option<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl EventSink for VecSink {
        fn name(&self) -> &str {
            "vec"
        }

        fn handle_event(&mut self, event: &EventRecord) -> Result<(), SinkError> {
            if self.fail_after == Some(self.events.len()) {
                return Err(SinkError::Io(std::io::Error::other("disk full")));
            }
            self.events.push(event.clone());
            if let Some((n, cancel)) = &self.cancel_after {
                if self.events.len() == *n {
                    cancel.cancel();
                }
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            self.flushes += 1;
            Ok(())
        }
    }

    /// Yields queued results, then terminates.
    struct ScriptedSource {
        results: std::collections::VecDeque<Result<RawEventRecord, SourceError>>,
        dropped: Option<u64>,
    }

    impl EventSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recv(&mut self) -> Result<RawEventRecord, SourceError> {
            self.results
                .pop_front()
                .unwrap_or(Err(SourceError::ProducerTerminated))
        }

        fn dropped(&self) -> Option<u64> {
            self.dropped
        }
    }

    #[test]
    fn test_assemble_passes_fields_through() {
        let (_clock, mut asm) = assembler();
        let input = raw(10_800_000_000_000, &[0x65], Direction::Input);

        let event = asm.assemble(input.clone());
        assert_eq!(event.raw, input);
        assert_eq!(event.len(), 1);
        assert_eq!(event.raw.buf, vec![0x65]);
        assert_eq!((event.pid(), event.tgid()), (2579, 2579));
        assert_eq!(event.wall_time_ns, EPOCH_NS);
    }

    #[test]
    fn test_assemble_records_stats() {
        let stats = Arc::new(EventStats::new());
        let (_clock, asm) = assembler();
        let mut asm = asm.with_stats(Arc::clone(&stats));

        asm.assemble(raw(1, b"ab", Direction::Output));
        asm.assemble(raw(2, b"c", Direction::Input));

        let snap = stats.snapshot();
        let total_bytes: u64 = snap.iter().map(|c| c.bytes).sum();
        assert_eq!(snap.len(), 2);
        assert_eq!(total_bytes, 3);
    }

    #[test]
    fn test_assemble_reports_metrics() {
        let metrics = Arc::new(HealthMetrics::new(":0").unwrap());
        let (clock, asm) = assembler();
        let mut asm = asm.with_metrics(Arc::clone(&metrics));

        asm.assemble(raw(1_000, b"e", Direction::Input));
        clock.advance(10_000_000);
        asm.assemble(raw(2_000, b"e", Direction::Output));

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("parrotty_events_received_total 2"));
        assert!(text.contains("parrotty_clock_recalibrations_total{reason=\"initial\"} 1"));
        assert!(text.contains("parrotty_clock_recalibrations_total{reason=\"drift\"} 1"));
        assert!(text.contains("parrotty_clock_drift_nanoseconds_count 1"));
    }

    #[tokio::test]
    async fn test_run_dispatches_in_arrival_order() {
        let (producer, mut source) = ChannelSource::bounded(16);
        // Arrival order differs from rawtime order across CPUs.
        for t in [300, 100, 200] {
            producer.submit(raw(t, b"x", Direction::Output)).unwrap();
        }

        let cancel = CancellationToken::new();
        let (_clock, mut asm) = assembler();
        let mut sink = VecSink {
            cancel_after: Some((3, cancel.clone())),
            ..Default::default()
        };
        let summary = asm.run(&mut source, &mut sink, cancel).await.unwrap();

        let order: Vec<u64> = sink.events.iter().map(|e| e.raw.rawtime).collect();
        assert_eq!(order, vec![300, 100, 200]);
        assert_eq!(summary.events, 3);
        assert_eq!(summary.recalibrations, 0);
        assert_eq!(summary.dropped, Some(0));
        assert_eq!(sink.flushes, 1);
        drop(producer);
    }

    #[tokio::test]
    async fn test_producer_gone_propagates() {
        let (producer, mut source) = ChannelSource::bounded(4);
        producer.submit(raw(1, b"a", Direction::Input)).unwrap();
        drop(producer);

        let (_clock, mut asm) = assembler();
        let mut sink = VecSink::default();
        let err = asm
            .run(&mut source, &mut sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AssembleError::Source(SourceError::ProducerTerminated)
        ));
        // Events read before the failure were delivered and flushed.
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.flushes, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (producer, mut source) = ChannelSource::bounded(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_clock, mut asm) = assembler();
        let mut sink = VecSink::default();
        let summary = asm.run(&mut source, &mut sink, cancel).await.unwrap();

        assert_eq!(summary.events, 0);
        assert!(sink.events.is_empty());
        drop(producer);
    }

    #[tokio::test]
    async fn test_run_cancel_while_waiting() {
        let (producer, mut source) = ChannelSource::bounded(4);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (_clock, mut asm) = assembler();
        let mut sink = VecSink::default();
        let summary = asm.run(&mut source, &mut sink, cancel).await.unwrap();
        assert_eq!(summary.events, 0);
        drop(producer);
    }

    #[tokio::test]
    async fn test_source_failure_halts_and_propagates() {
        let mut source = ScriptedSource {
            results: [
                Ok(raw(1, b"a", Direction::Input)),
                Err(SourceError::Malformed(ParseError::SizeMismatch { size: 12 })),
                Ok(raw(2, b"b", Direction::Input)),
            ]
            .into(),
            dropped: None,
        };

        let (_clock, mut asm) = assembler();
        let mut sink = VecSink::default();
        let err = asm
            .run(&mut source, &mut sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AssembleError::Source(SourceError::Malformed(_))
        ));
        // The record after the failure is never read.
        assert_eq!(sink.events.len(), 1);
        assert_eq!(source.results.len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_halts() {
        let mut source = ScriptedSource {
            results: [
                Ok(raw(1, b"a", Direction::Input)),
                Ok(raw(2, b"b", Direction::Input)),
                Ok(raw(3, b"c", Direction::Input)),
            ]
            .into(),
            dropped: None,
        };

        let (_clock, mut asm) = assembler();
        let mut sink = VecSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let err = asm
            .run(&mut source, &mut sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::Sink(_)));
        assert_eq!(sink.events.len(), 1);
        assert_eq!(source.results.len(), 1);
    }

    #[tokio::test]
    async fn test_drops_are_surfaced() {
        let metrics = Arc::new(HealthMetrics::new(":0").unwrap());
        let (producer, mut source) = ChannelSource::bounded(1);
        producer.submit(raw(1, b"a", Direction::Input)).unwrap();
        assert!(producer.submit(raw(2, b"b", Direction::Input)).is_err());
        assert!(producer.submit(raw(3, b"c", Direction::Input)).is_err());

        let cancel = CancellationToken::new();
        let (_clock, asm) = assembler();
        let mut asm = asm.with_metrics(Arc::clone(&metrics));
        let mut sink = VecSink {
            cancel_after: Some((1, cancel.clone())),
            ..Default::default()
        };
        let summary = asm.run(&mut source, &mut sink, cancel).await.unwrap();

        assert_eq!(summary.events, 1);
        assert_eq!(summary.dropped, Some(2));
        assert!(metrics
            .gather_text()
            .unwrap()
            .contains("parrotty_events_dropped_total 2"));
        drop(producer);
    }

    #[tokio::test]
    async fn test_drops_surface_while_idle() {
        let metrics = Arc::new(HealthMetrics::new(":0").unwrap());
        let (producer, mut source) = ChannelSource::bounded(1);
        producer.submit(raw(1, b"a", Direction::Input)).unwrap();
        for t in 2..7 {
            assert!(producer.submit(raw(t, b"b", Direction::Input)).is_err());
        }

        let cancel = CancellationToken::new();
        let (_clock, asm) = assembler();
        let mut asm = asm
            .with_metrics(Arc::clone(&metrics))
            .with_drop_poll_period(Duration::from_millis(10));
        let mut sink = VecSink::default();

        let run = asm.run(&mut source, &mut sink, cancel.clone());
        let check = async {
            // The burst is over; the loop is parked waiting for records.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let text = metrics.gather_text().unwrap();
            cancel.cancel();
            text
        };
        let (summary, text) = tokio::join!(run, check);

        assert!(text.contains("parrotty_events_dropped_total 5"));
        let summary = summary.unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(summary.dropped, Some(5));
        drop(producer);
    }

    #[tokio::test]
    async fn test_run_through_boxed_sink() {
        let (producer, mut source) = ChannelSource::bounded(4);
        producer.submit(raw(1, b"a", Direction::Input)).unwrap();

        let cancel = CancellationToken::new();
        let (_clock, mut asm) = assembler();
        let mut sink: Box<dyn EventSink> = Box::new(VecSink {
            cancel_after: Some((1, cancel.clone())),
            ..Default::default()
        });
        let summary = asm.run(&mut source, &mut sink, cancel).await.unwrap();
        assert_eq!(summary.events, 1);
        drop(producer);
    }
}
