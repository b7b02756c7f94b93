//! Estimation algorithms for the flexure control loop
//!
//! This module turns pairs of solved samples into drift rates and decides how
//! the running shift-rate estimate should respond.

mod drift_estimator;

pub use drift_estimator::{exposure_ratio, DriftDecision, DriftEstimator, DriftMeasurement};
