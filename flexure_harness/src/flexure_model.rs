//! Differential flexure between the guide scope and the imaging scope
//!
//! The imaging field drifts relative to the guide star by a steady rate plus
//! an optional oscillation, e.g. a tube sagging as the telescope tracks
//! across the sky. Offsets are in arcseconds (RA in arcseconds of RA angle).

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Linear-plus-sinusoidal flexure model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlexureModel {
    /// Steady RA drift in arcsec/hr
    pub linear_ra: f64,
    /// Steady Dec drift in arcsec/hr
    pub linear_dec: f64,
    /// RA oscillation amplitude in arcsec
    pub amplitude_ra: f64,
    /// Dec oscillation amplitude in arcsec
    pub amplitude_dec: f64,
    /// Oscillation period in hours
    pub period_hours: f64,
}

impl FlexureModel {
    /// Constant drift, no oscillation
    pub fn linear(ra_arcsec_per_hour: f64, dec_arcsec_per_hour: f64) -> Self {
        Self {
            linear_ra: ra_arcsec_per_hour,
            linear_dec: dec_arcsec_per_hour,
            amplitude_ra: 0.0,
            amplitude_dec: 0.0,
            period_hours: 1.0,
        }
    }

    /// Add an oscillation on top of the steady drift
    pub fn with_oscillation(
        mut self,
        amplitude_ra: f64,
        amplitude_dec: f64,
        period_hours: f64,
    ) -> Self {
        self.amplitude_ra = amplitude_ra;
        self.amplitude_dec = amplitude_dec;
        self.period_hours = period_hours;
        self
    }

    fn has_oscillation(&self) -> bool {
        self.period_hours > 0.0 && (self.amplitude_ra != 0.0 || self.amplitude_dec != 0.0)
    }

    /// Offset of the imaging field after `hours`, (ra, dec) in arcsec
    pub fn offset_arcsec(&self, hours: f64) -> (f64, f64) {
        let mut ra = self.linear_ra * hours;
        let mut dec = self.linear_dec * hours;
        if self.has_oscillation() {
            let phase = (2.0 * PI * hours / self.period_hours).sin();
            ra += self.amplitude_ra * phase;
            dec += self.amplitude_dec * phase;
        }
        (ra, dec)
    }

    /// Instantaneous drift rate after `hours`, (ra, dec) in arcsec/hr
    pub fn rate_arcsec_per_hour(&self, hours: f64) -> (f64, f64) {
        let mut ra = self.linear_ra;
        let mut dec = self.linear_dec;
        if self.has_oscillation() {
            let omega = 2.0 * PI / self.period_hours;
            let slope = omega * (omega * hours).cos();
            ra += self.amplitude_ra * slope;
            dec += self.amplitude_dec * slope;
        }
        (ra, dec)
    }

    /// Short human readable description
    pub fn description(&self) -> String {
        if self.has_oscillation() {
            format!(
                "{:.1} | {:.1} arcsec/hr with {:.1} | {:.1} arcsec over {:.2} h",
                self.linear_ra,
                self.linear_dec,
                self.amplitude_ra,
                self.amplitude_dec,
                self.period_hours
            )
        } else {
            format!("{:.1} | {:.1} arcsec/hr", self.linear_ra, self.linear_dec)
        }
    }
}

impl Default for FlexureModel {
    fn default() -> Self {
        Self::linear(12.0, 0.0)
    }
}
