use crate::equipment::{BinningMode, FilterInfo, LockPosition};
use crate::reset::OpticalReference;
use crate::trigger::TriggerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::Equatorial;

/// Lock position shift rate in arcseconds per hour
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShiftRate {
    /// RA rate in arcseconds of RA per hour
    pub ra: f64,
    /// Dec rate in arcseconds per hour
    pub dec: f64,
}

impl ShiftRate {
    pub const ZERO: ShiftRate = ShiftRate { ra: 0.0, dec: 0.0 };

    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    pub fn is_zero(&self) -> bool {
        self.ra == 0.0 && self.dec == 0.0
    }
}

/// One solved reference exposure
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// When the measurement cycle that produced this sample began
    pub timestamp: DateTime<Utc>,
    /// Solved field centre
    pub coordinates: Equatorial,
    /// Solved image scale in arcsec per pixel
    pub pixel_scale: f64,
    pub binning: BinningMode,
    pub filter: Option<FilterInfo>,
    pub focuser_position: Option<i32>,
}

/// Running estimate of the misalignment rate between the two instruments.
///
/// This is the only state that survives between measurement cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftState {
    /// Currently applied shift rate
    pub shift_rate: ShiftRate,
    /// Baseline sample for the next drift measurement
    pub last_sample: Option<Sample>,
    /// Guider lock position recorded with the baseline
    pub last_lock_position: Option<LockPosition>,
    /// Longest light exposure seen since the last estimation, seconds
    pub max_interval_secs: f64,
    /// Filter and focus recorded at the last valid sample
    pub reference: OpticalReference,
}

impl DriftState {
    /// Fold the duration of the latest light exposure into the interval accumulator
    pub fn note_exposure_interval(&mut self, exposure_secs: f64) {
        if exposure_secs.is_finite() {
            self.max_interval_secs = self.max_interval_secs.max(exposure_secs);
        }
    }

    /// Forget the baseline sample and lock position, keeping the rate estimate
    pub fn clear_caches(&mut self) {
        self.last_sample = None;
        self.last_lock_position = None;
        self.max_interval_secs = 0.0;
    }

    /// Zero the rate and forget everything comparable
    pub fn full_reset(&mut self) {
        self.clear_caches();
        self.shift_rate = ShiftRate::ZERO;
    }
}

/// Session-scoped record of degraded-safety warnings already shown.
///
/// Flags only ever go from false to true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidityFlags {
    pub pixel_scale_warned: bool,
    pub nan_warned: bool,
}

impl ValidityFlags {
    /// Returns true the first time it is called
    pub fn first_pixel_scale_warning(&mut self) -> bool {
        !std::mem::replace(&mut self.pixel_scale_warned, true)
    }

    /// Returns true the first time it is called
    pub fn first_nan_warning(&mut self) -> bool {
        !std::mem::replace(&mut self.nan_warned, true)
    }
}

/// Sequencer status of the compensator as a sequence item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStatus {
    /// Freshly created or re-enabled
    Created,
    Running,
    Finished,
    Failed,
    Skipped,
    Disabled,
}

/// Immutable view of the compensator state for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct DriftSnapshot {
    pub shift_rate: ShiftRate,
    pub last_sample: Option<Sample>,
    pub last_lock_position: Option<LockPosition>,
    pub max_interval_secs: f64,
    /// Light exposures completed so far
    pub exposure_count: u64,
    /// Exposure count at the last measurement
    pub last_measured_count: u64,
    /// Light exposures since the last measurement, modulo the skip factor
    pub progress_exposures: u64,
    pub trigger_state: TriggerState,
    /// Listening to equipment events
    pub running: bool,
    /// Guiding RMS of the last saved light frame in arcseconds
    pub image_rms_arcsec: Option<f64>,
    pub warnings: ValidityFlags,
}

impl DriftSnapshot {
    /// One-based progress counter for display
    pub fn progress_exposures_plus_one(&self) -> u64 {
        self.progress_exposures + 1
    }
}
