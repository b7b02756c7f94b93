//! Drift Estimator
//!
//! Converts two time-stamped solves of the imaging field into a drift rate and
//! feeds a fraction of it back into the lock position shift rate.
//!
//! # Operation
//! 1. Build a [`DriftMeasurement`] from the baseline and the new solve
//! 2. Call [`DriftEstimator::evaluate`] with the solved pixel scale and the
//!    longest light exposure seen since the previous estimation
//! 3. Apply the new rate only on [`DriftDecision::Correct`]
//!
//! # Units
//! - Drift: arcseconds (RA in arcseconds of RA angle, not scaled by cos(dec))
//! - Rates: arcseconds per hour
//! - Limits: imaging pixels per exposure interval

use crate::config::CompensatorConfig;
use crate::state::ShiftRate;
use shared::Equatorial;

/// Drift observed between two solves of the same field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftMeasurement {
    /// RA drift in arcseconds of RA
    pub ra_arcsec: f64,
    /// Dec drift in arcseconds
    pub dec_arcsec: f64,
    /// Great-circle distance in arcseconds
    pub distance_arcsec: f64,
    /// Wall-clock time between the solves in seconds
    pub elapsed_secs: f64,
}

impl DriftMeasurement {
    /// Drift going from `baseline` to `current` over `elapsed_secs`
    pub fn between(baseline: &Equatorial, current: &Equatorial, elapsed_secs: f64) -> Self {
        let separation = *current - *baseline;
        Self {
            ra_arcsec: separation.ra_arcsec(),
            dec_arcsec: separation.dec_arcsec(),
            distance_arcsec: separation.distance_arcsec(),
            elapsed_secs,
        }
    }

    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed_secs / 3600.0
    }

    /// Drift rate per axis in arcseconds per hour
    pub fn rate(&self) -> ShiftRate {
        let hours = self.elapsed_hours();
        ShiftRate::new(self.ra_arcsec / hours, self.dec_arcsec / hours)
    }
}

/// Ratio of elapsed time to the longest light exposure seen.
///
/// Returns `None` when there is no usable exposure interval.
pub fn exposure_ratio(elapsed_secs: f64, max_interval_secs: f64) -> Option<f64> {
    if !max_interval_secs.is_finite() || max_interval_secs <= 0.0 {
        return None;
    }
    Some(elapsed_secs / max_interval_secs)
}

/// What the estimator decided to do with a measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftDecision {
    /// No light exposure or no elapsed time to normalise against
    Indeterminate,
    /// Drift below the noise threshold
    Deadband {
        distance_arcsec: f64,
        threshold_arcsec: f64,
    },
    /// Drift above the discontinuity threshold
    Outlier {
        distance_arcsec: f64,
        threshold_arcsec: f64,
    },
    /// Drift accepted
    Correct {
        drift_rate: ShiftRate,
        new_rate: ShiftRate,
    },
}

impl DriftDecision {
    /// The rate to apply, if the decision changes it
    pub fn new_rate(&self) -> Option<ShiftRate> {
        match self {
            DriftDecision::Correct { new_rate, .. } => Some(*new_rate),
            _ => None,
        }
    }
}

/// Deadband, outlier rejection and proportional feedback on the drift rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftEstimator {
    /// Gain applied to the measured drift rate
    pub aggressivity: f64,
    /// Noise threshold in imaging pixels per exposure interval
    pub min_drift_limit_px: f64,
    /// Discontinuity threshold in imaging pixels per exposure interval
    pub max_drift_limit_px: f64,
}

impl DriftEstimator {
    pub fn new(aggressivity: f64, min_drift_limit_px: f64, max_drift_limit_px: f64) -> Self {
        Self {
            aggressivity,
            min_drift_limit_px,
            max_drift_limit_px,
        }
    }

    pub fn from_config(config: &CompensatorConfig) -> Self {
        Self::new(
            config.aggressivity,
            config.min_drift_limit_px,
            config.max_drift_limit_px,
        )
    }

    /// Decide how `current_rate` responds to `measurement`
    ///
    /// `pixel_scale` is the solved imaging scale in arcsec per pixel.
    pub fn evaluate(
        &self,
        measurement: &DriftMeasurement,
        pixel_scale: f64,
        max_interval_secs: f64,
        current_rate: ShiftRate,
    ) -> DriftDecision {
        if measurement.elapsed_secs.is_nan() || measurement.elapsed_secs <= 0.0 {
            return DriftDecision::Indeterminate;
        }
        if !pixel_scale.is_finite() || pixel_scale <= 0.0 {
            return DriftDecision::Indeterminate;
        }
        let Some(ratio) = exposure_ratio(measurement.elapsed_secs, max_interval_secs) else {
            return DriftDecision::Indeterminate;
        };

        let distance = measurement.distance_arcsec;
        let min_threshold = ratio * self.min_drift_limit_px * pixel_scale;
        let max_threshold = ratio * self.max_drift_limit_px * pixel_scale;

        if distance < min_threshold {
            return DriftDecision::Deadband {
                distance_arcsec: distance,
                threshold_arcsec: min_threshold,
            };
        }
        if distance > max_threshold {
            return DriftDecision::Outlier {
                distance_arcsec: distance,
                threshold_arcsec: max_threshold,
            };
        }

        let drift_rate = measurement.rate();
        let new_rate = ShiftRate::new(
            current_rate.ra - drift_rate.ra * self.aggressivity,
            current_rate.dec - drift_rate.dec * self.aggressivity,
        );
        DriftDecision::Correct {
            drift_rate,
            new_rate,
        }
    }
}

impl Default for DriftEstimator {
    fn default() -> Self {
        Self::from_config(&CompensatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const HOUR: f64 = 3600.0;

    fn baseline() -> Equatorial {
        Equatorial::from_degrees(150.0, 0.0)
    }

    fn ra_drift(arcsec: f64, elapsed_secs: f64) -> DriftMeasurement {
        let base = baseline();
        DriftMeasurement::between(&base, &base.offset_arcsec(arcsec, 0.0), elapsed_secs)
    }

    #[test]
    fn test_measurement_components() {
        let base = baseline();
        let m = DriftMeasurement::between(&base, &base.offset_arcsec(3.0, -4.0), 1800.0);
        assert_relative_eq!(m.ra_arcsec, 3.0, epsilon = 1e-6);
        assert_relative_eq!(m.dec_arcsec, -4.0, epsilon = 1e-6);
        assert_relative_eq!(m.distance_arcsec, 5.0, epsilon = 1e-5);
        let rate = m.rate();
        assert_relative_eq!(rate.ra, 6.0, epsilon = 1e-5);
        assert_relative_eq!(rate.dec, -8.0, epsilon = 1e-5);
    }

    #[test]
    fn test_large_drift_is_rejected_as_outlier() {
        let estimator = DriftEstimator::new(0.5, 0.3, 5.0);
        let current = ShiftRate::new(1.5, -0.5);
        let decision = estimator.evaluate(&ra_drift(10.0, HOUR), 1.0, HOUR, current);
        assert!(matches!(decision, DriftDecision::Outlier { .. }));
        assert_eq!(decision.new_rate(), None);
    }

    #[test]
    fn test_moderate_drift_updates_rate() {
        let estimator = DriftEstimator::new(0.5, 0.3, 5.0);
        let current = ShiftRate::new(1.5, -0.5);
        let decision = estimator.evaluate(&ra_drift(2.0, HOUR), 1.0, HOUR, current);
        let new_rate = decision.new_rate().expect("rate should change");
        assert_relative_eq!(new_rate.ra, 0.5, epsilon = 1e-6);
        assert_relative_eq!(new_rate.dec, -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_small_drift_is_deadband() {
        let estimator = DriftEstimator::new(0.5, 0.3, 5.0);
        let decision = estimator.evaluate(&ra_drift(0.2, HOUR), 1.0, HOUR, ShiftRate::ZERO);
        match decision {
            DriftDecision::Deadband {
                distance_arcsec,
                threshold_arcsec,
            } => {
                assert_relative_eq!(distance_arcsec, 0.2, epsilon = 1e-6);
                assert_relative_eq!(threshold_arcsec, 0.3, epsilon = 1e-12);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_thresholds_scale_with_exposure_ratio() {
        let estimator = DriftEstimator::new(0.5, 0.3, 5.0);
        // Two exposure intervals elapsed, so 8 arcsec is within 2 x 5 px
        let decision = estimator.evaluate(&ra_drift(8.0, 2.0 * HOUR), 1.0, HOUR, ShiftRate::ZERO);
        let new_rate = decision.new_rate().expect("rate should change");
        assert_relative_eq!(new_rate.ra, -2.0, epsilon = 1e-5);

        // At 2 arcsec/px the noise threshold doubles
        let decision = estimator.evaluate(&ra_drift(0.5, HOUR), 2.0, HOUR, ShiftRate::ZERO);
        assert!(matches!(decision, DriftDecision::Deadband { .. }));
    }

    #[test]
    fn test_zero_interval_is_indeterminate() {
        let estimator = DriftEstimator::default();
        let current = ShiftRate::new(2.0, 2.0);
        assert_eq!(
            estimator.evaluate(&ra_drift(2.0, HOUR), 1.0, 0.0, current),
            DriftDecision::Indeterminate
        );
        assert_eq!(
            estimator.evaluate(&ra_drift(2.0, 0.0), 1.0, HOUR, current),
            DriftDecision::Indeterminate
        );
        assert_eq!(exposure_ratio(10.0, f64::NAN), None);
        assert_eq!(exposure_ratio(600.0, 300.0), Some(2.0));
    }

    #[test]
    fn test_unusable_pixel_scale_is_indeterminate() {
        let estimator = DriftEstimator::default();
        let current = ShiftRate::new(1.0, 0.0);
        for scale in [f64::NAN, f64::INFINITY, 0.0, -1.2] {
            assert_eq!(
                estimator.evaluate(&ra_drift(3600.0, HOUR), scale, HOUR, current),
                DriftDecision::Indeterminate,
                "scale {scale}"
            );
        }
    }

    #[test]
    fn test_update_is_exact_per_axis() {
        let estimator = DriftEstimator::new(0.8, 0.0, 100.0);
        let base = baseline();
        let m = DriftMeasurement::between(&base, &base.offset_arcsec(-1.5, 2.5), 900.0);
        let current = ShiftRate::new(4.0, -3.0);
        let decision = estimator.evaluate(&m, 1.0, 900.0, current);

        let DriftDecision::Correct {
            drift_rate,
            new_rate,
        } = decision
        else {
            panic!("expected a correction, got {decision:?}");
        };
        assert_relative_eq!(new_rate.ra, current.ra - drift_rate.ra * 0.8, epsilon = 1e-12);
        assert_relative_eq!(new_rate.dec, current.dec - drift_rate.dec * 0.8, epsilon = 1e-12);
        assert_relative_eq!(drift_rate.ra, -6.0, epsilon = 1e-5);
        assert_relative_eq!(drift_rate.dec, 10.0, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_gain_keeps_rate() {
        let estimator = DriftEstimator::new(0.0, 0.3, 5.0);
        let current = ShiftRate::new(1.0, 1.0);
        let decision = estimator.evaluate(&ra_drift(2.0, HOUR), 1.0, HOUR, current);
        assert_eq!(decision.new_rate(), Some(current));
    }
}
