use crate::error::{FlexureError, FlexureResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Plate solving settings taken from the imaging profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateSolveSettings {
    /// Gain for reference exposures, -1 for the camera default
    pub gain: i32,
    /// Search radius around the mount position in degrees
    pub search_radius_deg: f64,
    /// Maximum number of stars the solver may use
    pub max_objects: u32,
    /// Number of sky regions the solver may search
    pub regions: u32,
    /// Imaging telescope focal length in millimetres
    pub focal_length_mm: f64,
    /// Imaging camera pixel size in micrometres
    pub pixel_size_um: f64,
    /// Retry blindly when the hinted solve fails
    pub blind_failover_enabled: bool,
}

impl Default for PlateSolveSettings {
    fn default() -> Self {
        Self {
            gain: -1,
            search_radius_deg: 30.0,
            max_objects: 500,
            regions: 5000,
            focal_length_mm: 800.0,
            pixel_size_um: 3.76,
            blind_failover_enabled: true,
        }
    }
}

/// Configuration for the flexure compensator
///
/// Passed in at construction and replaceable between cycles through
/// `FlexureCompensator::update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensatorConfig {
    /// Fraction of the measured drift rate fed back into the shift rate
    pub aggressivity: f64,
    /// Drift below this many imaging pixels per exposure is treated as noise
    pub min_drift_limit_px: f64,
    /// Drift above this many imaging pixels per exposure is treated as a discontinuity
    pub max_drift_limit_px: f64,
    /// Exposure time for reference snapshots in seconds
    pub plate_solve_exposure_secs: f64,
    /// Measure after every Nth light exposure
    pub after_exposures: u32,
    /// Keep comparing samples across filter changes
    pub ignore_filter_changes: bool,
    /// Keep comparing samples across focuser moves
    pub ignore_focus_changes: bool,
    pub plate_solve: PlateSolveSettings,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            aggressivity: 0.5,
            min_drift_limit_px: 0.3,
            max_drift_limit_px: 5.0,
            plate_solve_exposure_secs: 5.0,
            after_exposures: 1,
            ignore_filter_changes: false,
            ignore_focus_changes: false,
            plate_solve: PlateSolveSettings::default(),
        }
    }
}

impl CompensatorConfig {
    /// Check the configuration for values the control loop cannot work with
    pub fn validate(&self) -> FlexureResult<()> {
        if !self.aggressivity.is_finite() || self.aggressivity < 0.0 {
            return Err(FlexureError::InvalidConfig(format!(
                "aggressivity must be a non-negative number, got {}",
                self.aggressivity
            )));
        }
        if !self.min_drift_limit_px.is_finite() || self.min_drift_limit_px < 0.0 {
            return Err(FlexureError::InvalidConfig(format!(
                "min_drift_limit_px must be a non-negative number, got {}",
                self.min_drift_limit_px
            )));
        }
        if !self.max_drift_limit_px.is_finite() || self.max_drift_limit_px < 0.0 {
            return Err(FlexureError::InvalidConfig(format!(
                "max_drift_limit_px must be a non-negative number, got {}",
                self.max_drift_limit_px
            )));
        }
        if self.min_drift_limit_px > self.max_drift_limit_px {
            return Err(FlexureError::InvalidConfig(format!(
                "min_drift_limit_px ({}) exceeds max_drift_limit_px ({})",
                self.min_drift_limit_px, self.max_drift_limit_px
            )));
        }
        if !self.plate_solve_exposure_secs.is_finite() || self.plate_solve_exposure_secs <= 0.0 {
            return Err(FlexureError::InvalidConfig(format!(
                "plate_solve_exposure_secs must be positive, got {}",
                self.plate_solve_exposure_secs
            )));
        }
        if self.after_exposures == 0 {
            return Err(FlexureError::InvalidConfig(
                "after_exposures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> FlexureResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON file and validate
    ///
    /// Missing fields fall back to their defaults.
    pub fn load_from_file(path: &Path) -> FlexureResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: CompensatorConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
