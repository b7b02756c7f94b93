//! Decides when accumulated drift state stops being comparable
//!
//! A filter swap or a focuser move changes the optical path of the imaging
//! train, so a sample taken before it cannot be compared with one taken
//! after. A meridian flip changes the mechanical load on both instruments
//! and throws away the whole rate estimate.

use crate::config::CompensatorConfig;
use crate::equipment::{FilterInfo, FilterWheelInfo, FocuserInfo, ImageType};
use crate::events::EquipmentEvent;
use log::debug;

/// Filter and focus recorded with the last valid sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpticalReference {
    pub filter: Option<FilterInfo>,
    /// Focuser position, 0 until one has been recorded
    pub focus_position: i32,
}

impl OpticalReference {
    /// Record the current filter and focus for devices that are connected
    pub fn record(&mut self, wheel: &FilterWheelInfo, focuser: &FocuserInfo) {
        if wheel.connected {
            self.filter = wheel.selected_filter.clone();
            if let Some(filter) = &self.filter {
                debug!("Filter: {}", filter.name);
            }
        }
        if focuser.connected {
            self.focus_position = focuser.position;
            debug!("Focus position: {}", self.focus_position);
        }
    }
}

/// What an equipment event does to the drift state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResetAction {
    /// Leave the drift state alone
    None,
    /// Zero the rate, clear every cache and stop shifting
    FullReset,
    /// Store the guiding RMS of a saved light frame
    RecordImageRms(f64),
}

/// Staleness rules for filter and focus changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetPolicy {
    pub ignore_filter_changes: bool,
    pub ignore_focus_changes: bool,
}

impl ResetPolicy {
    pub fn from_config(config: &CompensatorConfig) -> Self {
        Self {
            ignore_filter_changes: config.ignore_filter_changes,
            ignore_focus_changes: config.ignore_focus_changes,
        }
    }

    /// Whether the current filter still matches the reference
    pub fn is_filter_ok(&self, wheel: &FilterWheelInfo, reference: &OpticalReference) -> bool {
        if !wheel.connected {
            return true;
        }
        if self.ignore_filter_changes {
            debug!("Filter changes are to be ignored");
            return true;
        }
        let Some(last) = &reference.filter else {
            return false;
        };
        match &wheel.selected_filter {
            Some(current) if current.position == last.position => {
                debug!("Filter has not changed, was {} and is {}", last.name, current.name);
                true
            }
            Some(current) => {
                debug!("Filter has changed, was {} and is {}", last.name, current.name);
                false
            }
            None => {
                debug!("Filter has changed, was {} and is now unknown", last.name);
                false
            }
        }
    }

    /// Whether the focuser is still where the reference was taken
    pub fn is_focus_ok(&self, focuser: &FocuserInfo, reference: &OpticalReference) -> bool {
        if !focuser.connected {
            return true;
        }
        if self.ignore_focus_changes {
            debug!("Focus changes are to be ignored");
            return true;
        }
        let ok = focuser.position == reference.focus_position;
        debug!(
            "Focus has {}changed, was {} and is {}",
            if ok { "not " } else { "" },
            reference.focus_position,
            focuser.position
        );
        ok
    }

    /// Map an equipment event to its effect on the drift state
    pub fn classify(&self, event: &EquipmentEvent) -> ResetAction {
        match event {
            EquipmentEvent::MeridianFlipCompleted => ResetAction::FullReset,
            // Lock position checks already catch the dither offset on the next cycle
            EquipmentEvent::DitherCompleted => ResetAction::None,
            EquipmentEvent::BeforeImageSaved(info) if info.image_type == ImageType::Light => {
                ResetAction::RecordImageRms(info.recorded_rms_total * info.rms_scale)
            }
            EquipmentEvent::BeforeImageSaved(_) => ResetAction::None,
        }
    }
}
