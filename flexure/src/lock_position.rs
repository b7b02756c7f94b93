//! Guide lock position validation
//!
//! Between two samples the guider's lock position should only move by what
//! the applied shift rate explains. Anything else (a dither, a slip, a manual
//! nudge) means the previous sample can no longer be compared to a new one.

use crate::equipment::{LockPosition, NotificationLevel, StatusSink};
use crate::state::{ShiftRate, ValidityFlags};
use log::{debug, warn};

/// Relative tolerance on the expected lock displacement
pub const RELATIVE_TOLERANCE: f64 = 0.25;

/// Absolute tolerance floor in guide pixels
pub const ABSOLUTE_TOLERANCE_PX: f64 = 0.02;

/// Why a check could not be performed and was assumed to pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedCheck {
    /// Guider did not report a usable pixel scale
    PixelScaleUnavailable,
    /// Expected displacement came out as NaN or infinite
    ExpectedNotFinite,
}

/// Outcome of comparing the current lock position with the recorded one
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockValidity {
    /// Nothing recorded to compare against
    NoBaseline,
    /// Moved as far as the shift rate explains
    Consistent { distance_px: f64, expected_px: f64 },
    /// Moved differently than the shift rate explains
    Moved { distance_px: f64, expected_px: f64 },
    /// Guider stopped reporting a lock position
    Missing,
    /// Check skipped, position assumed valid
    AssumedValid(DegradedCheck),
}

impl LockValidity {
    pub fn is_valid(&self) -> bool {
        !matches!(self, LockValidity::Moved { .. } | LockValidity::Missing)
    }
}

/// Lock displacement in guide pixels the shift rate explains over `elapsed_hours`.
///
/// The RA rate is in arcseconds of RA and is scaled by cos(dec) to get the
/// on-sky motion.
pub fn expected_displacement_px(
    rate: ShiftRate,
    dec_rad: f64,
    guide_pixel_scale: f64,
    elapsed_hours: f64,
) -> f64 {
    let ra_px = rate.ra * dec_rad.cos() / guide_pixel_scale;
    let dec_px = rate.dec / guide_pixel_scale;
    ((ra_px.powi(2) + dec_px.powi(2)) * elapsed_hours.powi(2)).sqrt()
}

/// Euclidean distance between two lock positions in guide pixels
pub fn lock_distance_px(a: &LockPosition, b: &LockPosition) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Whether an actual displacement agrees with the expected one
pub fn within_tolerance(distance_px: f64, expected_px: f64) -> bool {
    (distance_px - expected_px).abs() <= (RELATIVE_TOLERANCE * expected_px).max(ABSOLUTE_TOLERANCE_PX)
}

/// Compare a current lock position against the recorded one.
///
/// Degraded conditions are reported once per session through `flags` and
/// the status sink, and always resolve to a permissive result.
pub fn check_lock_position(
    last: Option<&LockPosition>,
    current: Option<&LockPosition>,
    rate: ShiftRate,
    dec_rad: f64,
    guide_pixel_scale: f64,
    flags: &mut ValidityFlags,
    status: &dyn StatusSink,
) -> LockValidity {
    let Some(last) = last else {
        return LockValidity::NoBaseline;
    };

    if guide_pixel_scale.is_nan() || guide_pixel_scale <= 0.0 {
        if flags.first_pixel_scale_warning() {
            warn!(
                "Guider pixel scale not available ({}); lock position movements cannot be validated",
                guide_pixel_scale
            );
            status.notify(
                NotificationLevel::Warning,
                "Guider pixel scale not available. Safety checks are reduced.",
            );
        }
        return LockValidity::AssumedValid(DegradedCheck::PixelScaleUnavailable);
    }

    let Some(current) = current else {
        debug!("Guider reported no lock position, last was {}", last);
        return LockValidity::Missing;
    };

    let distance_px = lock_distance_px(current, last);
    let elapsed_hours = (current.event_time - last.event_time).num_milliseconds() as f64 / 3_600_000.0;
    let expected_px = expected_displacement_px(rate, dec_rad, guide_pixel_scale, elapsed_hours);
    debug!(
        "Lock moved {:.5} px in {:.5} h, expected {:.5} px",
        distance_px, elapsed_hours, expected_px
    );

    if !expected_px.is_finite() {
        if flags.first_nan_warning() {
            warn!("Expected lock displacement is not a number; check telescope and guider data");
            status.notify(
                NotificationLevel::Warning,
                "A calculation error occurred. Safety checks are reduced.",
            );
        }
        return LockValidity::AssumedValid(DegradedCheck::ExpectedNotFinite);
    }

    if within_tolerance(distance_px, expected_px) {
        debug!("Lock position within tolerance of the expected displacement");
        LockValidity::Consistent {
            distance_px,
            expected_px,
        }
    } else {
        debug!("Lock position NOT within tolerance of the expected displacement");
        LockValidity::Moved {
            distance_px,
            expected_px,
        }
    }
}
