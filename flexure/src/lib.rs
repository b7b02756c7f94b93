//! FLEXURE - Differential flexure compensation for guided imaging
//!
//! A guide scope and an imaging train bolted together never stay perfectly
//! aligned. This crate measures the slow drift between the two by plate
//! solving short reference snapshots around light exposures and moves the
//! guider lock position at a rate that cancels it.
//!
//! One measurement cycle runs per exposure boundary:
//! trigger -> acquire -> solve -> validate -> estimate -> actuate

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

pub mod acquire;
pub mod actuator;
pub mod config;
pub mod controllers;
pub mod equipment;
pub mod error;
pub mod events;
pub mod lock_position;
pub mod mock_equipment;
pub mod reset;
pub mod solve;
pub mod state;
pub mod trigger;

use crate::acquire::{report_status, CaptureGate, SampleAcquirer};
use crate::actuator::ShiftRateActuator;
use crate::controllers::{DriftDecision, DriftEstimator, DriftMeasurement};
use crate::equipment::{BinningMode, LockPosition, NotificationLevel};
use crate::events::{EventBus, EventSubscription};
use crate::lock_position::{check_lock_position, LockValidity};
use crate::reset::{ResetAction, ResetPolicy};
use crate::solve::{solve_parameter, FieldSolverAdapter, SolvedField};
use crate::state::{DriftState, Sample, ValidityFlags};
use crate::trigger::{CycleContext, CyclePhase, TriggerMachine};

// Re-export commonly used types for external use
pub use crate::config::{CompensatorConfig, PlateSolveSettings};
pub use crate::equipment::Equipment;
pub use crate::error::{FlexureError, FlexureResult};
pub use crate::events::EquipmentEvent;
pub use crate::state::{DriftSnapshot, ShiftRate, TriggerStatus};
pub use crate::trigger::ExposureItem;

fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Everything the compensator mutates, guarded by one lock
struct CompensatorState {
    config: CompensatorConfig,
    drift: DriftState,
    trigger: TriggerMachine,
    flags: ValidityFlags,
    /// Listening to equipment events
    running: bool,
    image_rms_arcsec: Option<f64>,
    subscription: Option<EventSubscription>,
}

impl CompensatorState {
    fn new(config: CompensatorConfig) -> Self {
        Self {
            config,
            drift: DriftState::default(),
            trigger: TriggerMachine::new(),
            flags: ValidityFlags::default(),
            running: false,
            image_rms_arcsec: None,
            subscription: None,
        }
    }

    fn snapshot(&self) -> DriftSnapshot {
        DriftSnapshot {
            shift_rate: self.drift.shift_rate,
            last_sample: self.drift.last_sample.clone(),
            last_lock_position: self.drift.last_lock_position,
            max_interval_secs: self.drift.max_interval_secs,
            exposure_count: self.trigger.exposure_count(),
            last_measured_count: self.trigger.last_measured_count(),
            progress_exposures: self.trigger.progress_exposures(self.config.after_exposures),
            trigger_state: self.trigger.state(),
            running: self.running,
            image_rms_arcsec: self.image_rms_arcsec,
            warnings: self.flags,
        }
    }
}

struct Inner {
    equipment: Equipment,
    bus: EventBus,
    acquirer: SampleAcquirer,
    solver: FieldSolverAdapter,
    actuator: ShiftRateActuator,
    state: Mutex<CompensatorState>,
    snapshot_tx: watch::Sender<DriftSnapshot>,
}

impl Inner {
    fn publish(&self, state: &CompensatorState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    fn check_lock(
        &self,
        state: &mut CompensatorState,
        current: Option<&LockPosition>,
    ) -> LockValidity {
        let guider = self.equipment.guider.info();
        let dec = self.equipment.mount.current_position().dec;
        check_lock_position(
            state.drift.last_lock_position.as_ref(),
            current,
            state.drift.shift_rate,
            dec,
            guider.pixel_scale,
            &mut state.flags,
            self.equipment.status.as_ref(),
        )
    }

    fn optics_unchanged(&self, state: &CompensatorState, policy: &ResetPolicy) -> bool {
        policy.is_filter_ok(&self.equipment.filter_wheel.info(), &state.drift.reference)
            && policy.is_focus_ok(&self.equipment.focuser.info(), &state.drift.reference)
    }

    fn begin_cycle(
        &self,
        phase: CyclePhase,
        binning: BinningMode,
        config: &CompensatorConfig,
    ) -> CycleContext {
        CycleContext::begin(
            phase,
            binning,
            config.plate_solve_exposure_secs,
            &self.equipment.filter_wheel.info(),
            &self.equipment.focuser.info(),
        )
    }

    fn commit_sample(
        &self,
        state: &mut CompensatorState,
        cycle: CycleContext,
        field: SolvedField,
        timestamp: DateTime<Utc>,
        lock: Option<LockPosition>,
    ) {
        state.drift.last_sample = Some(Sample {
            timestamp,
            coordinates: field.coordinates,
            pixel_scale: field.pixel_scale,
            binning: cycle.binning,
            filter: cycle.filter,
            focuser_position: cycle.focuser_position,
        });
        state.drift.last_lock_position = lock;
        state.drift.reference.record(
            &self.equipment.filter_wheel.info(),
            &self.equipment.focuser.info(),
        );
        state.trigger.mark_measured();
        debug!("Lock position: {:?}", lock);
    }

    fn solve_failed(&self) {
        warn!("Plate solve failed");
        self.equipment
            .status
            .notify(NotificationLevel::Warning, "Plate solve failed");
    }

    /// Take a reference snapshot and solve it
    async fn snap_and_solve(
        &self,
        config: &CompensatorConfig,
        cycle: &CycleContext,
        token: &CancellationToken,
    ) -> FlexureResult<Option<SolvedField>> {
        debug!("Taking a snapshot and solving ({:?} exposure)", cycle.phase);
        report_status(self.equipment.status.as_ref(), "Exposing");
        let spec = self.acquirer.reference_exposure(
            cycle.binning,
            cycle.exposure_secs,
            config.plate_solve.gain,
        );
        let mount = self.equipment.mount.info();
        let hint = mount.connected.then_some(mount.coordinates);
        let parameter = solve_parameter(&config.plate_solve, cycle.binning, hint);

        let Some(image) = self.acquirer.capture_image(&spec, token).await? else {
            return Ok(None);
        };
        if token.is_cancelled() {
            return Err(FlexureError::Cancelled);
        }
        self.solver.solve(&image, &parameter, token).await
    }

    async fn run_cycle(
        &self,
        state: &mut CompensatorState,
        token: &CancellationToken,
    ) -> FlexureResult<()> {
        debug!("Executing flexure compensation cycle");
        let config = state.config.clone();
        let policy = ResetPolicy::from_config(&config);
        let mut this_lock = self.equipment.guider.lock_position();
        let mut this_time = self.equipment.clock.now();
        let item_duration = state.trigger.exposure_item_duration();
        state.drift.note_exposure_interval(item_duration);

        if let Some(binning) = state.trigger.take_after() {
            debug!("Last lock position   : {:?}", state.drift.last_lock_position);
            debug!("Current lock position: {:?}", this_lock);
            let lock_valid = state.drift.last_lock_position.is_none()
                || self.check_lock(state, this_lock.as_ref()).is_valid();

            if !(lock_valid && self.optics_unchanged(state, &policy)) {
                debug!("Just after exposure item - previous exposure no longer valid, a new reference image will be taken before next light sub");
            } else if !state.trigger.is_measurement_due(config.after_exposures) {
                debug!(
                    "Just after exposure item - {} of {} exposures since last measurement",
                    state.trigger.progress_exposures(config.after_exposures),
                    config.after_exposures
                );
            } else {
                debug!("Just after exposure item - starting capture for plate solving");
                let cycle = self.begin_cycle(CyclePhase::After, binning, &config);
                let Some(field) = self.snap_and_solve(&config, &cycle, token).await? else {
                    self.solve_failed();
                    state.drift.last_sample = None;
                    state.trigger.take_before();
                    return Ok(());
                };
                debug!("Field plate solved - coordinates {}", field.coordinates);

                if let Some(baseline) = state.drift.last_sample.clone() {
                    let elapsed = secs_between(baseline.timestamp, self.equipment.clock.now());
                    let measurement =
                        DriftMeasurement::between(&baseline.coordinates, &field.coordinates, elapsed);
                    debug!(
                        "Drifted {:.3} arcsec in RA in {:.3} minutes",
                        measurement.ra_arcsec,
                        elapsed / 60.0
                    );
                    debug!(
                        "Drifted {:.3} arcsec in Dec in {:.3} minutes",
                        measurement.dec_arcsec,
                        elapsed / 60.0
                    );

                    let estimator = DriftEstimator::from_config(&config);
                    match estimator.evaluate(
                        &measurement,
                        field.pixel_scale,
                        state.drift.max_interval_secs,
                        state.drift.shift_rate,
                    ) {
                        DriftDecision::Indeterminate => {
                            info!("No light exposure interval or image scale to scale against, leaving shift rate unchanged");
                        }
                        DriftDecision::Deadband {
                            distance_arcsec,
                            threshold_arcsec,
                        } => {
                            info!(
                                "Drifted {:.3} arcsec, less than the minimum drift of {:.3} arcsec ({} px), leaving shift rate unchanged",
                                distance_arcsec, threshold_arcsec, config.min_drift_limit_px
                            );
                        }
                        DriftDecision::Outlier {
                            distance_arcsec,
                            threshold_arcsec,
                        } => {
                            info!(
                                "Drifted {:.3} arcsec, more than the maximum drift of {:.3} arcsec ({} px), leaving shift rate unchanged",
                                distance_arcsec, threshold_arcsec, config.max_drift_limit_px
                            );
                        }
                        DriftDecision::Correct {
                            drift_rate,
                            new_rate,
                        } => {
                            debug!(
                                "Drift rate {:.3} | {:.3} arcsec/hr",
                                drift_rate.ra, drift_rate.dec
                            );
                            state.drift.shift_rate = new_rate;
                            info!(
                                "New shift rate: {:.2} | {:.2} arcsec/hr",
                                new_rate.ra, new_rate.dec
                            );
                            self.actuator.apply(new_rate).await;
                            // The new rate moves the lock point, so the reference is taken after it
                            this_lock = self.equipment.guider.lock_position();
                            this_time = self.equipment.clock.now();
                            debug!("Updated lock position: {:?}", this_lock);
                        }
                    }
                    state.drift.max_interval_secs = 0.0;
                } else {
                    debug!("Image plate solved but no previous image at same location exists, leaving shift rate unchanged");
                }

                self.commit_sample(state, cycle, field, this_time, this_lock);
            }
        }

        if let Some(binning) = state.trigger.take_before() {
            debug!("Last lock position   : {:?}", state.drift.last_lock_position);
            debug!("Current lock position: {:?}", this_lock);
            let stale = state.drift.last_lock_position.is_none()
                || !self.check_lock(state, this_lock.as_ref()).is_valid()
                || !self.optics_unchanged(state, &policy);

            if stale {
                debug!("Just before exposure item - previous exposure not valid, starting capture for plate solving");
                let cycle = self.begin_cycle(CyclePhase::Before, binning, &config);
                let Some(field) = self.snap_and_solve(&config, &cycle, token).await? else {
                    self.solve_failed();
                    state.drift.last_sample = None;
                    state.drift.last_lock_position = None;
                    return Ok(());
                };
                debug!("Field plate solved - coordinates {}", field.coordinates);
                self.commit_sample(state, cycle, field, this_time, this_lock);
                state.drift.max_interval_secs = 0.0;
            } else {
                debug!("Just before exposure item - last plate solved capture still valid");
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: EquipmentEvent) {
        let mut state = self.state.lock().await;
        let policy = ResetPolicy::from_config(&state.config);
        match policy.classify(&event) {
            ResetAction::FullReset => {
                info!("Meridian flip completed - restarting from shift rate zero");
                state.drift.full_reset();
                state.trigger.mark_measured();
                self.actuator.zero_and_stop().await;
            }
            ResetAction::None => {
                debug!("{:?} received, drift state unchanged", event);
            }
            ResetAction::RecordImageRms(rms) => {
                if state.running {
                    state.image_rms_arcsec = Some(rms);
                }
            }
        }
        self.publish(&state);
    }
}

/// Closed-loop flexure compensator.
///
/// Host sequencers call [`should_trigger_after`](Self::should_trigger_after)
/// and [`should_trigger`](Self::should_trigger) around every exposure and
/// [`execute`](Self::execute) when either returned true. Dropping the
/// compensator stops its event listener.
pub struct FlexureCompensator {
    inner: Arc<Inner>,
}

impl FlexureCompensator {
    pub fn new(equipment: Equipment, bus: EventBus, config: CompensatorConfig) -> FlexureResult<Self> {
        Self::with_capture_gate(equipment, bus, config, CaptureGate::new())
    }

    /// Create a compensator sharing `gate` with other camera users
    pub fn with_capture_gate(
        equipment: Equipment,
        bus: EventBus,
        config: CompensatorConfig,
        gate: CaptureGate,
    ) -> FlexureResult<Self> {
        config.validate()?;
        let state = CompensatorState::new(config);
        let (snapshot_tx, _rx) = watch::channel(state.snapshot());
        let inner = Inner {
            acquirer: SampleAcquirer::new(&equipment, gate),
            solver: FieldSolverAdapter::new(equipment.solver.clone(), equipment.status.clone()),
            actuator: ShiftRateActuator::new(equipment.guider.clone()),
            equipment,
            bus,
            state: Mutex::new(state),
            snapshot_tx,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// A fresh compensator on the same equipment and configuration, with zero rates
    pub async fn duplicate(&self) -> FlexureResult<Self> {
        let config = self.config().await;
        Self::with_capture_gate(
            self.inner.equipment.clone(),
            self.inner.bus.clone(),
            config,
            self.inner.acquirer.gate().clone(),
        )
    }

    pub async fn config(&self) -> CompensatorConfig {
        self.inner.state.lock().await.config.clone()
    }

    /// Replace the configuration; takes effect from the next cycle
    pub async fn update_config(&self, config: CompensatorConfig) -> FlexureResult<()> {
        config.validate()?;
        let mut state = self.inner.state.lock().await;
        state.config = config;
        self.inner.publish(&state);
        Ok(())
    }

    /// Problems that prevent the compensator from working, empty when ready
    pub fn validate(&self) -> Vec<String> {
        let equipment = &self.inner.equipment;
        let mut issues = Vec::new();
        if !equipment.camera.is_connected() {
            issues.push("Camera not connected".to_string());
        }
        if !equipment.mount.info().connected {
            issues.push("Telescope not connected".to_string());
        }
        let guider = equipment.guider.info();
        if !guider.connected {
            issues.push("Guider not connected".to_string());
        } else if !guider.can_set_shift_rate {
            issues.push("Guider doesn't support shifting lock point".to_string());
        } else if !guider.can_get_lock_position {
            issues.push("Guider doesn't support reading lock position".to_string());
        }
        issues
    }

    /// Called before `next` runs; true if a before-exposure check is armed
    pub async fn should_trigger(&self, next: &ExposureItem) -> bool {
        let mut state = self.inner.state.lock().await;
        let armed = state.trigger.should_trigger(next);
        self.inner.publish(&state);
        armed
    }

    /// Called after `previous` finished; true if an after-exposure check is armed
    pub async fn should_trigger_after(&self, previous: &ExposureItem) -> bool {
        let mut state = self.inner.state.lock().await;
        let armed = state.trigger.should_trigger_after(previous);
        self.inner.publish(&state);
        armed
    }

    /// Run the armed checks for this exposure boundary.
    ///
    /// The after-check runs to completion, including any rate push, before
    /// the before-check starts. On error the committed drift state is left
    /// as it was before the failing check and nothing stays armed.
    pub async fn execute(&self, token: &CancellationToken) -> FlexureResult<()> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.run_cycle(&mut state, token).await;
        if result.is_err() {
            // A failed boundary consumes both checks
            state.trigger.disarm();
        }
        self.inner.publish(&state);
        result
    }

    /// Apply an equipment event directly
    pub async fn handle_event(&self, event: EquipmentEvent) {
        self.inner.handle_event(event).await;
    }

    fn subscribe(&self) -> EventSubscription {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        EventSubscription::spawn(self.inner.bus.subscribe(), move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.handle_event(event).await;
                        true
                    }
                    None => false,
                }
            }
        })
    }

    async fn turn_on(&self, state: &mut CompensatorState) {
        info!("Turning flexure compensation ON");
        if state.subscription.is_none() {
            state.subscription = Some(self.subscribe());
        }
        self.inner.actuator.apply(state.drift.shift_rate).await;
        state.drift.clear_caches();
        state.running = true;
    }

    async fn turn_off(&self, state: &mut CompensatorState) {
        info!("Turning flexure compensation OFF");
        state.subscription = None;
        state.trigger.disarm();
        self.inner.actuator.zero_and_stop().await;
        state.drift.clear_caches();
        state.running = false;
    }

    /// Entering the sequence block: listen for events and resume the current rate
    pub async fn block_initialize(&self) {
        debug!("Entering sequence block - registering event listeners");
        let mut state = self.inner.state.lock().await;
        self.turn_on(&mut state).await;
        self.inner.publish(&state);
    }

    /// Leaving the sequence block: stop listening and stop shifting, keeping the rate estimate
    pub async fn block_teardown(&self) {
        debug!("Exiting sequence block - un-registering event listeners and stopping shifting");
        let mut state = self.inner.state.lock().await;
        self.turn_off(&mut state).await;
        self.inner.publish(&state);
    }

    /// React to the sequencer changing this item's status
    pub async fn on_status_changed(&self, status: TriggerStatus) {
        let mut state = self.inner.state.lock().await;
        match status {
            TriggerStatus::Disabled => self.turn_off(&mut state).await,
            TriggerStatus::Created => {
                state.drift.shift_rate = ShiftRate::ZERO;
                self.turn_on(&mut state).await;
            }
            _ => return,
        }
        self.inner.publish(&state);
    }

    /// React to being attached to (or detached from) a parent container
    pub async fn on_parent_changed(&self, parent_status: Option<TriggerStatus>) {
        match parent_status {
            None => self.block_teardown().await,
            Some(TriggerStatus::Running) => self.block_initialize().await,
            Some(_) => {}
        }
    }

    /// Stop listening for events. Safe to call more than once.
    pub async fn dispose(&self) {
        let mut state = self.inner.state.lock().await;
        if state.subscription.take().is_some() {
            debug!("Flexure compensator disposed");
        }
        self.inner.publish(&state);
    }

    /// Whether the event listener is active
    pub async fn is_subscribed(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .subscription
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }

    /// Latest published state
    pub fn snapshot(&self) -> DriftSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receive a new snapshot after every state change
    pub fn subscribe_state(&self) -> watch::Receiver<DriftSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn capture_gate(&self) -> &CaptureGate {
        self.inner.acquirer.gate()
    }
}

impl std::fmt::Debug for FlexureCompensator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FlexureCompensator")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}
