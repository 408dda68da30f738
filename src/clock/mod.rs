//! Conversion of boot-relative probe timestamps into wall-clock time.
//!
//! The probe can only read the monotonic clock, which stops during suspend and
//! never follows NTP steps. The [`Calibrator`] keeps an offset between the two
//! clocks and re-anchors it whenever a fresh wall-clock sample disagrees with the
//! extrapolated estimate by more than the drift threshold, or when the anchor is
//! older than the refresh interval.
//!
//! The wall clock is sampled on every call. Reading it in user space is cheap
//! and never touches the capture path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

/// Default maximum tolerated divergence before re-anchoring (1 ms).
pub const DRIFT_THRESHOLD_NS: u64 = 1_000_000;

/// Default maximum age of an anchor, in monotonic time (60 s).
pub const REFRESH_INTERVAL_NS: u64 = 60_000_000_000;

/// Source of wall-clock readings.
pub trait WallClock: Send {
    /// Nanoseconds since the Unix epoch.
    fn now_ns(&self) -> u64;
}

/// The host's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64
    }
}

/// A wall clock that only moves when told to. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualWallClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualWallClock {
    pub fn new(now_ns: u64) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(now_ns)),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl WallClock for ManualWallClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}

/// Why the offset was (re)computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recalibration {
    /// First event seen; no anchor existed yet.
    Initial,
    /// The wall clock diverged from the estimate (NTP step, suspend/resume).
    Drift { drift_ns: u64 },
    /// The anchor aged past the refresh interval.
    Refresh { elapsed_ns: u64 },
}

impl Recalibration {
    /// Returns the metric/log label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Drift { .. } => "drift",
            Self::Refresh { .. } => "refresh",
        }
    }
}

impl fmt::Display for Recalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of calibrating one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// Estimated wall-clock time in nanoseconds since the Unix epoch.
    pub wall_time_ns: u64,
    /// Divergence between the extrapolated estimate and the sampled wall clock.
    /// Zero on the first call.
    pub drift_ns: u64,
    /// Set when this call re-anchored the offset.
    pub recalibration: Option<Recalibration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CalibrationState {
    /// Wall clock minus monotonic clock, in nanoseconds.
    offset: i64,
    /// Monotonic time of the last anchor.
    last_calibration: u64,
}

/// Stateful monotonic-to-wall-clock converter.
///
/// Owned by a single caller; the offset is private and only moves inside
/// [`Calibrator::calibrate`].
pub struct Calibrator<C: WallClock = SystemWallClock> {
    clock: C,
    drift_threshold_ns: u64,
    refresh_interval_ns: u64,
    state: Option<CalibrationState>,
    recalibrations: u64,
}

impl<C: WallClock> fmt::Debug for Calibrator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calibrator")
            .field("drift_threshold_ns", &self.drift_threshold_ns)
            .field("refresh_interval_ns", &self.refresh_interval_ns)
            .field("calibrated", &self.state.is_some())
            .field("recalibrations", &self.recalibrations)
            .finish()
    }
}

impl Calibrator<SystemWallClock> {
    /// Create a calibrator reading the system clock with default thresholds.
    pub fn new() -> Self {
        Self::with_clock(SystemWallClock)
    }
}

impl Default for Calibrator<SystemWallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: WallClock> Calibrator<C> {
    /// Create a calibrator over the given clock with default thresholds.
    pub fn with_clock(clock: C) -> Self {
        Self::with_params(clock, DRIFT_THRESHOLD_NS, REFRESH_INTERVAL_NS)
    }

    /// Create a calibrator with explicit thresholds.
    pub fn with_params(clock: C, drift_threshold_ns: u64, refresh_interval_ns: u64) -> Self {
        Self {
            clock,
            drift_threshold_ns,
            refresh_interval_ns,
            state: None,
            recalibrations: 0,
        }
    }

    /// Convert a monotonic timestamp into an estimated wall-clock timestamp.
    pub fn calibrate(&mut self, rawtime: u64) -> u64 {
        self.calibrate_traced(rawtime).wall_time_ns
    }

    /// Like [`Calibrator::calibrate`], also reporting drift and whether the
    /// offset was re-anchored.
    pub fn calibrate_traced(&mut self, rawtime: u64) -> Calibration {
        let now = self.clock.now_ns();

        let Some(state) = self.state else {
            self.anchor(rawtime, now);
            info!(rawtime, wall_time_ns = now, "clock calibrated");
            return Calibration {
                wall_time_ns: now,
                drift_ns: 0,
                recalibration: Some(Recalibration::Initial),
            };
        };

        let extrapolated = apply_offset(rawtime, state.offset);
        let drift_ns = now.abs_diff(extrapolated);
        // Records from another CPU can predate the anchor.
        let elapsed_ns = rawtime.saturating_sub(state.last_calibration);

        let recalibration = if drift_ns > self.drift_threshold_ns {
            Some(Recalibration::Drift { drift_ns })
        } else if elapsed_ns > self.refresh_interval_ns {
            Some(Recalibration::Refresh { elapsed_ns })
        } else {
            None
        };

        match recalibration {
            Some(reason) => {
                self.anchor(rawtime, now);
                self.recalibrations += 1;
                debug!(%reason, drift_ns, elapsed_ns, "clock recalibrated");
                Calibration {
                    wall_time_ns: now,
                    drift_ns,
                    recalibration,
                }
            }
            None => Calibration {
                wall_time_ns: extrapolated,
                drift_ns,
                recalibration: None,
            },
        }
    }

    /// Number of drift- or age-triggered re-anchors. The initial anchor is not counted.
    pub fn recalibrations(&self) -> u64 {
        self.recalibrations
    }

    /// Whether the first event has been seen.
    pub fn is_calibrated(&self) -> bool {
        self.state.is_some()
    }

    fn anchor(&mut self, rawtime: u64, now: u64) {
        self.state = Some(CalibrationState {
            offset: offset_between(now, rawtime),
            last_calibration: rawtime,
        });
    }
}

/// `wall - monotonic`, saturated to the `i64` range.
fn offset_between(wall_ns: u64, rawtime: u64) -> i64 {
    let diff = i128::from(wall_ns) - i128::from(rawtime);
    diff.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// `rawtime + offset`, saturated to the `u64` range.
fn apply_offset(rawtime: u64, offset: i64) -> u64 {
    let sum = i128::from(rawtime) + i128::from(offset);
    sum.clamp(0, i128::from(u64::MAX)) as u64
}
