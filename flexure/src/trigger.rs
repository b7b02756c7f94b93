//! Exposure-boundary trigger state machine
//!
//! The sequencer asks the compensator around every exposure whether it wants
//! to run. Only light frames arm a check. The machine remembers which checks
//! are armed and with what binning, counts completed light frames, and
//! decides whether the after-exposure measurement is due under the
//! exposure-skip factor.

use crate::equipment::{BinningMode, FilterInfo, FilterWheelInfo, FocuserInfo, ImageType};
use serde::{Deserialize, Serialize};

/// An exposure item in the imaging sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureItem {
    pub image_type: ImageType,
    pub binning: BinningMode,
    /// Exposure time in seconds
    pub exposure_time: f64,
}

impl ExposureItem {
    pub fn light(exposure_time: f64, binning: BinningMode) -> Self {
        Self {
            image_type: ImageType::Light,
            binning,
            exposure_time,
        }
    }

    pub fn is_light(&self) -> bool {
        self.image_type == ImageType::Light
    }
}

/// Which side of an exposure a measurement cycle runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    /// Ahead of the next light frame
    Before,
    /// Right after a light frame finished
    After,
}

/// One measurement attempt, built per exposure boundary and consumed at once
#[derive(Debug, Clone, PartialEq)]
pub struct CycleContext {
    pub phase: CyclePhase,
    /// Binning of the light frame this cycle belongs to
    pub binning: BinningMode,
    /// Reference exposure duration in seconds
    pub exposure_secs: f64,
    /// Filter in place when the cycle started, if a wheel is connected
    pub filter: Option<FilterInfo>,
    /// Focuser position when the cycle started, if a focuser is connected
    pub focuser_position: Option<i32>,
}

impl CycleContext {
    /// Snapshot the optical train at the start of a cycle
    pub fn begin(
        phase: CyclePhase,
        binning: BinningMode,
        exposure_secs: f64,
        wheel: &FilterWheelInfo,
        focuser: &FocuserInfo,
    ) -> Self {
        Self {
            phase,
            binning,
            exposure_secs,
            filter: wheel
                .connected
                .then(|| wheel.selected_filter.clone())
                .flatten(),
            focuser_position: focuser.connected.then_some(focuser.position),
        }
    }
}

/// Which checks are armed for the next `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Idle,
    PendingBefore,
    PendingAfter,
    /// Both armed; the after-check runs first
    PendingAfterThenBefore,
}

/// Bookkeeping for when measurement cycles run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerMachine {
    pending_before: Option<BinningMode>,
    pending_after: Option<BinningMode>,
    exposure_item_duration: f64,
    exposure_count: u64,
    last_measured_count: u64,
}

impl TriggerMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before `next` starts. Arms the before-check for light frames.
    pub fn should_trigger(&mut self, next: &ExposureItem) -> bool {
        if !next.is_light() {
            return false;
        }
        self.pending_before = Some(next.binning);
        self.exposure_item_duration = next.exposure_time;
        true
    }

    /// Called after `previous` completed. Arms the after-check for light
    /// frames and counts the exposure.
    pub fn should_trigger_after(&mut self, previous: &ExposureItem) -> bool {
        if !previous.is_light() {
            return false;
        }
        self.pending_after = Some(previous.binning);
        self.exposure_item_duration = previous.exposure_time;
        self.exposure_count += 1;
        true
    }

    pub fn state(&self) -> TriggerState {
        match (self.pending_after.is_some(), self.pending_before.is_some()) {
            (false, false) => TriggerState::Idle,
            (false, true) => TriggerState::PendingBefore,
            (true, false) => TriggerState::PendingAfter,
            (true, true) => TriggerState::PendingAfterThenBefore,
        }
    }

    /// Disarm the after-check, returning its binning if it was armed
    pub fn take_after(&mut self) -> Option<BinningMode> {
        self.pending_after.take()
    }

    /// Disarm the before-check, returning its binning if it was armed
    pub fn take_before(&mut self) -> Option<BinningMode> {
        self.pending_before.take()
    }

    /// Duration of the most recent light exposure item in seconds
    pub fn exposure_item_duration(&self) -> f64 {
        self.exposure_item_duration
    }

    pub fn exposure_count(&self) -> u64 {
        self.exposure_count
    }

    pub fn last_measured_count(&self) -> u64 {
        self.last_measured_count
    }

    /// Light frames since the last measurement, modulo the skip factor
    pub fn progress_exposures(&self, after_exposures: u32) -> u64 {
        if after_exposures == 0 {
            return 0;
        }
        (self.exposure_count - self.last_measured_count) % u64::from(after_exposures)
    }

    /// Whether the after-check should measure on this boundary
    pub fn is_measurement_due(&self, after_exposures: u32) -> bool {
        self.progress_exposures(after_exposures) == 0
    }

    /// Record that a sample was committed at the current exposure count
    pub fn mark_measured(&mut self) {
        self.last_measured_count = self.exposure_count;
    }

    /// Drop armed checks without touching the counters
    pub fn disarm(&mut self) {
        self.pending_before = None;
        self.pending_after = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark() -> ExposureItem {
        ExposureItem {
            image_type: ImageType::Dark,
            binning: BinningMode::default(),
            exposure_time: 60.0,
        }
    }

    #[test]
    fn test_non_light_exposures_are_ignored() {
        let mut machine = TriggerMachine::new();
        assert!(!machine.should_trigger(&dark()));
        assert!(!machine.should_trigger_after(&dark()));
        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.exposure_count(), 0);
        assert_eq!(machine.exposure_item_duration(), 0.0);
    }

    #[test]
    fn test_light_frames_arm_both_checks() {
        let mut machine = TriggerMachine::new();
        let light = ExposureItem::light(300.0, BinningMode::new(2, 2));

        assert!(machine.should_trigger(&light));
        assert_eq!(machine.state(), TriggerState::PendingBefore);

        assert!(machine.should_trigger_after(&light));
        assert_eq!(machine.state(), TriggerState::PendingAfterThenBefore);
        assert_eq!(machine.exposure_count(), 1);
        assert_eq!(machine.exposure_item_duration(), 300.0);

        assert_eq!(machine.take_after(), Some(BinningMode::new(2, 2)));
        assert_eq!(machine.state(), TriggerState::PendingBefore);
        assert_eq!(machine.take_before(), Some(BinningMode::new(2, 2)));
        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.take_before(), None);
    }

    #[test]
    fn test_skip_factor_gates_measurements() {
        let mut machine = TriggerMachine::new();
        let light = ExposureItem::light(120.0, BinningMode::default());

        let mut due = Vec::new();
        for _ in 0..7 {
            machine.should_trigger_after(&light);
            let is_due = machine.is_measurement_due(3);
            if is_due {
                machine.mark_measured();
            }
            due.push(is_due);
        }
        // Counts start at zero so the first frame is three away from due
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_progress_counter() {
        let mut machine = TriggerMachine::new();
        let light = ExposureItem::light(60.0, BinningMode::default());
        assert_eq!(machine.progress_exposures(4), 0);
        machine.should_trigger_after(&light);
        machine.should_trigger_after(&light);
        assert_eq!(machine.progress_exposures(4), 2);
        assert_eq!(machine.progress_exposures(1), 0);
        assert_eq!(machine.progress_exposures(0), 0);
        machine.mark_measured();
        assert_eq!(machine.progress_exposures(4), 0);
        assert_eq!(machine.last_measured_count(), 2);
    }

    #[test]
    fn test_cycle_context_ignores_disconnected_devices() {
        let wheel = FilterWheelInfo {
            connected: false,
            selected_filter: Some(FilterInfo::new("Ha", 4)),
        };
        let focuser = FocuserInfo {
            connected: true,
            position: 12000,
        };
        let ctx = CycleContext::begin(CyclePhase::After, BinningMode::new(2, 2), 5.0, &wheel, &focuser);
        assert_eq!(ctx.filter, None);
        assert_eq!(ctx.focuser_position, Some(12000));
        assert_eq!(ctx.phase, CyclePhase::After);
    }

    #[test]
    fn test_disarm_keeps_counters() {
        let mut machine = TriggerMachine::new();
        let light = ExposureItem::light(60.0, BinningMode::default());
        machine.should_trigger(&light);
        machine.should_trigger_after(&light);
        machine.disarm();
        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.exposure_count(), 1);
    }
}
