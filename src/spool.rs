use serde_json::Value;
use tracing::{debug, info};

use crate::config::Param;
use crate::store::{FlatStore, StoreError};

/// Fixed sample length the operator draws through the mechanism during a
/// calibration pull.
pub const CALIBRATION_SAMPLE_MM: u32 = 10_000;
/// A session with no finish command is aborted after this long.
pub const CALIBRATION_TIMEOUT_MS: u64 = 300_000;
/// Duplicate reset triggers inside this window are ignored.
pub const RESET_DEBOUNCE_MS: u64 = 2_000;

const FULL_EDGES_KEY: &str = "spool_full_edges";
/// Nominal quadrature edges per drive-roller revolution, used only by the
/// geometric fallback before the first empirical calibration.
const EDGES_PER_REV: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CalibrationSession {
    baseline_edges: u64,
    started_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationResult {
    pub full_edges: u64,
    pub roll_length_mm: u32,
    pub delta_edges: u64,
}

/// Converts encoder pulse counts into remaining-media metrics and owns the
/// calibration workflow. `calibrating` always initializes false on boot; a
/// session does not survive a restart.
#[derive(Debug)]
pub struct SpoolEstimator {
    full_edges: u64,
    used_edges: u64,
    lifetime_edges: u64,
    session: Option<CalibrationSession>,
    last_reset_ms: Option<u64>,
}

impl SpoolEstimator {
    /// Restore from the persisted store, falling back to the geometric
    /// default when no empirical calibration has been performed.
    pub fn from_store(store: &FlatStore) -> Self {
        let full_edges = store
            .get_raw(FULL_EDGES_KEY)
            .map(|v| v as u64)
            .unwrap_or_else(|| {
                geometric_full_edges(
                    store.get(Param::SpoolLengthMm),
                    store.get(Param::CoreDiameterMm),
                    store.get(Param::MediaThicknessUm),
                )
            });
        let used_edges = store.get_raw("spool_used_edges").map(|v| v as u64).unwrap_or(0);
        Self {
            full_edges,
            used_edges,
            lifetime_edges: used_edges,
            session: None,
            last_reset_ms: None,
        }
    }

    /// Account encoder pulses observed while the roller motor runs.
    pub fn record_pulses(&mut self, edges: u64) {
        self.used_edges = self.used_edges.saturating_add(edges);
        self.lifetime_edges = self.lifetime_edges.saturating_add(edges);
    }

    /// Account pulses from a manual calibration pull. These feed the
    /// session's baseline delta but are not media consumption, so a
    /// cancelled session leaves the usage counters as they were.
    pub fn record_calibration_pulses(&mut self, edges: u64) {
        self.lifetime_edges = self.lifetime_edges.saturating_add(edges);
    }

    /// Momentary reset trigger: zero the usage counters. A zero value or a
    /// duplicate trigger inside the debounce window is ignored. Returns
    /// true when the reset was applied; the caller clears the empty alarm
    /// and emits a refreshed status immediately.
    pub fn reset(&mut self, value: u32, now_ms: u64, store: &mut FlatStore) -> Result<bool, StoreError> {
        if value == 0 {
            return Ok(false);
        }
        if let Some(last) = self.last_reset_ms {
            if now_ms.saturating_sub(last) < RESET_DEBOUNCE_MS {
                debug!("ignoring duplicate spool reset inside debounce window");
                return Ok(false);
            }
        }
        self.used_edges = 0;
        self.last_reset_ms = Some(now_ms);
        store.set_raw("spool_used_edges", 0.0)?;
        info!("spool usage reset");
        Ok(true)
    }

    /// Snapshot the edge counter as the calibration baseline. Starting a
    /// new session while one is active implicitly restarts it.
    pub fn calibrate_start(&mut self, now_ms: u64) {
        if self.session.is_some() {
            info!("restarting active calibration session");
        }
        self.session = Some(CalibrationSession {
            baseline_edges: self.lifetime_edges,
            started_at_ms: now_ms,
        });
    }

    /// Finish the calibration pull. A zero `roll_length_mm` reuses the
    /// previously persisted length; a non-zero value is clamped and
    /// persisted. Usage counters reset to a fresh roll.
    pub fn calibrate_finish(
        &mut self,
        roll_length_mm: u32,
        store: &mut FlatStore,
    ) -> Result<Option<CalibrationResult>, StoreError> {
        let Some(session) = self.session.take() else {
            debug!("calibrate_finish without an active session");
            return Ok(None);
        };
        let delta_edges = self.lifetime_edges.saturating_sub(session.baseline_edges);
        let length_mm = if roll_length_mm == 0 {
            store.get(Param::SpoolLengthMm) as u32
        } else {
            store.set(Param::SpoolLengthMm, f64::from(roll_length_mm))? as u32
        };
        let full_edges =
            (delta_edges as f64 * (f64::from(length_mm) / f64::from(CALIBRATION_SAMPLE_MM))) as u64;
        self.full_edges = full_edges;
        self.used_edges = 0;
        store.set_raw(FULL_EDGES_KEY, full_edges as f64)?;
        store.set_raw("spool_used_edges", 0.0)?;
        info!(delta_edges, length_mm, full_edges, "calibration persisted");
        Ok(Some(CalibrationResult {
            full_edges,
            roll_length_mm: length_mm,
            delta_edges,
        }))
    }

    /// Abort the session without touching any persisted value. Returns
    /// true when a session was actually active.
    pub fn calibrate_cancel(&mut self) -> bool {
        self.session.take().is_some()
    }

    /// Deadline check against the monotonic clock; called every tick.
    /// Returns true when the session just timed out (aborted as cancel).
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if let Some(session) = self.session {
            if now_ms.saturating_sub(session.started_at_ms) >= CALIBRATION_TIMEOUT_MS {
                info!("calibration session timed out");
                self.session = None;
                return true;
            }
        }
        false
    }

    pub fn calibrating(&self) -> bool {
        self.session.is_some()
    }

    pub fn full_edges(&self) -> u64 {
        self.full_edges
    }

    pub fn used_edges(&self) -> u64 {
        self.used_edges
    }

    pub fn remaining_edges(&self) -> u64 {
        self.full_edges.saturating_sub(self.used_edges)
    }

    pub fn percent_remaining(&self) -> f64 {
        if self.full_edges == 0 {
            return 0.0;
        }
        (self.remaining_edges() as f64 / self.full_edges as f64) * 100.0
    }

    /// Spool block of the status payload.
    pub fn snapshot(&self, store: &FlatStore, empty_alarm: bool) -> Value {
        serde_json::json!({
            "full_edges": self.full_edges,
            "used_edges": self.used_edges,
            "remaining_edges": self.remaining_edges(),
            "percent_remaining": self.percent_remaining(),
            "empty_alarm": empty_alarm,
            "calibrating": self.calibrating(),
            "total_length_mm": store.get(Param::SpoolLengthMm) as u64,
            "core_diameter_mm": store.get(Param::CoreDiameterMm),
            "media_thickness_um": store.get(Param::MediaThicknessUm) as u64,
        })
    }
}

/// Theoretical edge budget for a fresh roll, from the wrap geometry: total
/// length L over n wraps of growing circumference, L = pi*n*d + pi*t*n^2,
/// solved for n.
fn geometric_full_edges(length_mm: f64, core_diameter_mm: f64, thickness_um: f64) -> u64 {
    let t = thickness_um / 1000.0;
    let d = core_diameter_mm;
    let pi = std::f64::consts::PI;
    let discriminant = (pi * d).powi(2) + 4.0 * pi * t * length_mm;
    let wraps = (discriminant.sqrt() - pi * d) / (2.0 * pi * t);
    (wraps.max(1.0) * EDGES_PER_REV) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> (SpoolEstimator, FlatStore) {
        let store = FlatStore::in_memory();
        (SpoolEstimator::from_store(&store), store)
    }

    #[test]
    fn worked_calibration_example() {
        let (mut spool, mut store) = estimator();
        spool.calibrate_start(0);
        spool.record_pulses(105_600);
        let result = spool
            .calibrate_finish(50_000, &mut store)
            .unwrap()
            .unwrap();
        assert_eq!(result.full_edges, 528_000);
        assert_eq!(spool.full_edges(), 528_000);
        assert_eq!(spool.used_edges(), 0);
    }

    #[test]
    fn finish_with_zero_length_reuses_persisted_length() {
        let (mut spool, mut store) = estimator();
        store.set(Param::SpoolLengthMm, 30_000.0).unwrap();
        spool.calibrate_start(0);
        spool.record_pulses(10_000);
        let result = spool.calibrate_finish(0, &mut store).unwrap().unwrap();
        assert_eq!(result.roll_length_mm, 30_000);
        assert_eq!(result.full_edges, 30_000);
    }

    #[test]
    fn cancel_leaves_persisted_calibration_untouched() {
        let (mut spool, mut store) = estimator();
        let before = spool.full_edges();
        spool.calibrate_start(0);
        spool.record_pulses(4_242);
        assert!(spool.calibrate_cancel());
        assert!(!spool.calibrating());
        assert_eq!(spool.full_edges(), before);
        assert!(spool.calibrate_finish(0, &mut store).unwrap().is_none());
    }

    #[test]
    fn calibration_pull_is_not_media_consumption() {
        let (mut spool, mut store) = estimator();
        spool.record_pulses(500);
        spool.calibrate_start(0);
        spool.record_calibration_pulses(4_000);
        assert!(spool.calibrate_cancel());
        assert_eq!(spool.used_edges(), 500);

        // The pull still lands in the baseline delta of a finished session.
        spool.calibrate_start(1_000);
        spool.record_calibration_pulses(10_000);
        let result = spool.calibrate_finish(10_000, &mut store).unwrap().unwrap();
        assert_eq!(result.delta_edges, 10_000);
    }

    #[test]
    fn session_times_out_after_five_minutes() {
        let (mut spool, _store) = estimator();
        spool.calibrate_start(1_000);
        assert!(!spool.tick(1_000 + CALIBRATION_TIMEOUT_MS - 1));
        assert!(spool.calibrating());
        assert!(spool.tick(1_000 + CALIBRATION_TIMEOUT_MS));
        assert!(!spool.calibrating());
    }

    #[test]
    fn reset_is_debounced() {
        let (mut spool, mut store) = estimator();
        spool.record_pulses(500);
        assert!(spool.reset(1, 10_000, &mut store).unwrap());
        spool.record_pulses(99);
        assert!(!spool.reset(1, 10_000 + RESET_DEBOUNCE_MS - 1, &mut store).unwrap());
        assert_eq!(spool.used_edges(), 99);
        assert!(spool.reset(1, 10_000 + RESET_DEBOUNCE_MS, &mut store).unwrap());
        assert_eq!(spool.used_edges(), 0);
    }

    #[test]
    fn zero_reset_value_is_ignored() {
        let (mut spool, mut store) = estimator();
        spool.record_pulses(500);
        assert!(!spool.reset(0, 10_000, &mut store).unwrap());
        assert_eq!(spool.used_edges(), 500);
    }

    #[test]
    fn geometric_default_scales_with_length() {
        let short = geometric_full_edges(10_000.0, 25.0, 100.0);
        let long = geometric_full_edges(200_000.0, 25.0, 100.0);
        assert!(long > short);
        assert!(short > 0);
    }
}
