use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::Recalibration;
use crate::tracer::event::Direction;

/// Prometheus metrics for the tracer, all under the "parrotty" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total records pulled from the event source.
    pub events_received: Counter,
    /// Records by direction.
    pub events_by_direction: CounterVec,
    /// Records the source reported as dropped at its boundary.
    pub events_dropped: Counter,
    /// Offset re-anchors by reason (initial/drift/refresh).
    pub clock_recalibrations: CounterVec,
    /// Divergence between extrapolated and sampled wall clock.
    pub clock_drift: Histogram,
    /// Time from receiving a record to the sink accepting it.
    pub event_processing_duration: Histogram,
    /// Ring buffer capacity in bytes.
    pub ringbuf_capacity_bytes: Gauge,
    /// Kernel probes currently attached.
    pub probes_attached: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received from the event source.",
            )
            .namespace("parrotty"),
        )?;
        let events_by_direction = CounterVec::new(
            Opts::new(
                "events_by_direction_total",
                "Total events received by direction.",
            )
            .namespace("parrotty"),
            &["direction"],
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total events dropped because the ring buffer was full.",
            )
            .namespace("parrotty"),
        )?;
        let clock_recalibrations = CounterVec::new(
            Opts::new(
                "clock_recalibrations_total",
                "Total clock offset recalibrations by reason.",
            )
            .namespace("parrotty"),
            &["reason"],
        )?;
        let clock_drift = Histogram::with_opts(
            HistogramOpts::new(
                "clock_drift_nanoseconds",
                "Absolute drift between extrapolated and sampled wall clock.",
            )
            .namespace("parrotty")
            .buckets(vec![
                1_000.0,
                10_000.0,
                100_000.0,
                1_000_000.0,
                10_000_000.0,
                1_000_000_000.0,
            ]),
        )?;
        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Time to calibrate, decode and emit a single event.",
            )
            .namespace("parrotty")
            .buckets(vec![0.000_001, 0.000_01, 0.000_05, 0.0001, 0.0005, 0.001, 0.005]),
        )?;
        let ringbuf_capacity_bytes = Gauge::with_opts(
            Opts::new(
                "ringbuf_capacity_bytes",
                "Total ring buffer capacity in bytes.",
            )
            .namespace("parrotty"),
        )?;
        let probes_attached = Gauge::with_opts(
            Opts::new("probes_attached", "Number of attached kernel probes.")
                .namespace("parrotty"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_by_direction.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(clock_recalibrations.clone()))?;
        registry.register(Box::new(clock_drift.clone()))?;
        registry.register(Box::new(event_processing_duration.clone()))?;
        registry.register(Box::new(ringbuf_capacity_bytes.clone()))?;
        registry.register(Box::new(probes_attached.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_by_direction,
            events_dropped,
            clock_recalibrations,
            clock_drift,
            event_processing_duration,
            ringbuf_capacity_bytes,
            probes_attached,
        })
    }

    /// Count one received record.
    pub fn observe_event(&self, direction: Direction) {
        self.events_received.inc();
        self.events_by_direction
            .with_label_values(&[direction.metric_label()])
            .inc();
    }

    /// Count one offset re-anchor.
    pub fn observe_recalibration(&self, reason: Recalibration) {
        self.clock_recalibrations
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    /// Render the registry in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
