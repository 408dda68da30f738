use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assembler::{Assembler, RunSummary};
use crate::clock::{Calibrator, SystemWallClock};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::{self, EventSink};
use crate::tracer::stats::EventStats;

#[cfg(feature = "bpf")]
use crate::tracer::bpf::BpfSource;

/// Agent orchestrates all components: probe source, assembler, sink, metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    captured_stats: Arc<EventStats>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            captured_stats: Arc::new(EventStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the event loop and background tasks when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attach the probes and dispatch events until cancelled or the source fails.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let mut sink = sink::open(&self.cfg.output)
            .with_context(|| format!("opening output {}", self.cfg.output.path))?;
        info!(path = %self.cfg.output.path, format = ?self.cfg.output.format, "output opened");

        let calibrator = Calibrator::with_params(
            SystemWallClock,
            self.cfg.calibration.drift_threshold_ns(),
            self.cfg.calibration.refresh_interval_ns(),
        );
        let mut assembler = Assembler::with_calibrator(calibrator)
            .with_metrics(Arc::clone(&self.health))
            .with_stats(Arc::clone(&self.captured_stats));

        self.spawn_event_stats_reporter();

        self.capture(&mut assembler, sink.as_mut()).await
    }

    #[cfg(feature = "bpf")]
    async fn capture(
        &self,
        assembler: &mut Assembler,
        sink: &mut dyn EventSink,
    ) -> Result<RunSummary> {
        let ring_buf_size =
            u32::try_from(self.cfg.ring_buffer_size).context("ring_buffer_size exceeds u32")?;
        let mut source = BpfSource::attach(ring_buf_size).context("attaching tty probes")?;

        self.health
            .ringbuf_capacity_bytes
            .set(f64::from(ring_buf_size));
        self.health
            .probes_attached
            .set(f64::from(source.attachment_stats().kprobes_attached));

        info!("capturing tty events");

        let summary = assembler
            .run(&mut source, sink, self.cancel.child_token())
            .await
            .context("dispatching tty events")?;

        self.health.probes_attached.set(0.0);
        Ok(summary)
    }

    #[cfg(not(feature = "bpf"))]
    async fn capture(
        &self,
        _assembler: &mut Assembler,
        _sink: &mut dyn EventSink,
    ) -> Result<RunSummary> {
        anyhow::bail!("kernel probes unavailable: built without the `bpf` feature")
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background per-direction event stats reporter.
    fn spawn_event_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let captured_stats = Arc::clone(&self.captured_stats);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => report_stats(&captured_stats, interval),
                }
            }
        });
    }
}

fn report_stats(stats: &EventStats, interval: Duration) {
    let snapshot = stats.snapshot();
    let total: u64 = snapshot.iter().map(|c| c.events).sum();

    if total == 0 {
        return;
    }

    info!(captured = total, interval = ?interval, "event stats");

    for count in &snapshot {
        debug!(
            direction = %count.direction,
            events = count.events,
            bytes = count.bytes,
            "  by direction",
        );
    }
}
