//! Simulated observatory rig
//!
//! Every collaborator the compensator talks to is backed by one shared
//! simulation state on a [`ManualClock`]. Time only moves when the rig is
//! told to advance it, either by the runner during light frames or by the
//! camera while it exposes.
//!
//! The imaging field is offset from the mount position by the flexure model,
//! the integral of the guider's lock shift rate, and any dithers or filter
//! wedge offsets. The guider lock position moves exactly as far as the shift
//! rate says it should, so lock checks pass unless something else moved it.

use crate::flexure_model::FlexureModel;
use async_trait::async_trait;
use flexure::equipment::{
    Camera, CameraInfo, DeviceError, DeviceResult, Equipment, ExposureHandle, ExposureSpec,
    FilterInfo, FilterWheel, FilterWheelInfo, Focuser, FocuserInfo, Guider, GuiderInfo,
    LockPosition, Mount, MountInfo, NotificationLevel, PlateSolveParameter, PlateSolveResult,
    PlateSolver, RawExposure, SiderealShiftRate, SolvableImage, StatusSink, StatusUpdate,
};
use log::{debug, error, info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use shared::{Clock, Equatorial, ManualClock};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Background level of simulated frames in ADU
const SKY_BACKGROUND_ADU: u16 = 1200;

/// Simulated frame size in pixels
const FRAME_SIZE: usize = 64;

/// Static description of the simulated rig
#[derive(Debug, Clone, PartialEq)]
pub struct RigConfig {
    /// Where the mount points
    pub field: Equatorial,
    /// Unbinned imaging scale in arcsec/px
    pub imaging_pixel_scale: f64,
    /// Guide camera scale in arcsec/px
    pub guide_pixel_scale: f64,
    pub flexure: FlexureModel,
    /// Standard deviation of solve noise per axis in arcsec
    pub solve_noise_arcsec: f64,
    /// Dec shift per filter wheel slot in arcsec
    pub filter_wedge_arcsec: f64,
    pub seed: u64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            field: Equatorial::from_hours_degrees(10.0, 20.0),
            imaging_pixel_scale: 1.0,
            guide_pixel_scale: 2.0,
            flexure: FlexureModel::default(),
            solve_noise_arcsec: 0.05,
            filter_wedge_arcsec: 1.5,
            seed: 42,
        }
    }
}

/// Mutable simulation state
struct SimState {
    config: RigConfig,
    elapsed_hours: f64,
    /// Flexure direction, flipped by a meridian flip
    flexure_sign: f64,
    flexure_origin_hours: f64,
    /// Flexure offset accumulated before the last flip
    flexure_base: (f64, f64),
    /// Lock shift rate in arcsec of RA / arcsec per hour
    shift_rate: (f64, f64),
    /// Imaging offset the shift rate has produced
    shift_offset: (f64, f64),
    /// Dither and filter wedge offsets
    static_offset: (f64, f64),
    lock: (f64, f64),
    filter: Option<FilterInfo>,
    focuser_position: i32,
    camera_connected: bool,
    failing_solves: u32,
    next_handle: u64,
    noise: Option<Normal<f64>>,
    rng: StdRng,
}

impl SimState {
    fn new(config: RigConfig) -> Self {
        let noise = (config.solve_noise_arcsec > 0.0)
            .then(|| Normal::new(0.0, config.solve_noise_arcsec).ok())
            .flatten();
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            elapsed_hours: 0.0,
            flexure_sign: 1.0,
            flexure_origin_hours: 0.0,
            flexure_base: (0.0, 0.0),
            shift_rate: (0.0, 0.0),
            shift_offset: (0.0, 0.0),
            static_offset: (0.0, 0.0),
            lock: (256.0, 256.0),
            filter: Some(FilterInfo::new("L", 0)),
            focuser_position: 10_000,
            camera_connected: true,
            failing_solves: 0,
            next_handle: 1,
            noise,
            rng,
        }
    }

    fn cos_dec(&self) -> f64 {
        self.config.field.dec.cos()
    }

    fn flexure_offset(&self) -> (f64, f64) {
        let model = &self.config.flexure;
        let (ra_now, dec_now) = model.offset_arcsec(self.elapsed_hours);
        let (ra_origin, dec_origin) = model.offset_arcsec(self.flexure_origin_hours);
        (
            self.flexure_base.0 + self.flexure_sign * (ra_now - ra_origin),
            self.flexure_base.1 + self.flexure_sign * (dec_now - dec_origin),
        )
    }

    fn flexure_rate(&self) -> (f64, f64) {
        let (ra, dec) = self.config.flexure.rate_arcsec_per_hour(self.elapsed_hours);
        (self.flexure_sign * ra, self.flexure_sign * dec)
    }

    fn imaging_offset(&self) -> (f64, f64) {
        let flexure = self.flexure_offset();
        (
            flexure.0 + self.shift_offset.0 + self.static_offset.0,
            flexure.1 + self.shift_offset.1 + self.static_offset.1,
        )
    }

    fn advance(&mut self, secs: f64) {
        let hours = secs / 3600.0;
        self.shift_offset.0 += self.shift_rate.0 * hours;
        self.shift_offset.1 += self.shift_rate.1 * hours;
        let scale = self.config.guide_pixel_scale;
        self.lock.0 += self.shift_rate.0 * self.cos_dec() / scale * hours;
        self.lock.1 += self.shift_rate.1 / scale * hours;
        self.elapsed_hours += hours;
    }

    fn sample_noise(&mut self) -> (f64, f64) {
        match self.noise {
            Some(normal) => (normal.sample(&mut self.rng), normal.sample(&mut self.rng)),
            None => (0.0, 0.0),
        }
    }
}

/// State shared by all simulated devices
struct Shared {
    state: Mutex<SimState>,
    clock: Arc<ManualClock>,
}

impl Shared {
    fn advance(&self, secs: f64) {
        if secs <= 0.0 || !secs.is_finite() {
            return;
        }
        self.state.lock().unwrap().advance(secs);
        self.clock.advance_secs(secs);
    }
}

/// A complete simulated rig
#[derive(Clone)]
pub struct SimulatedRig {
    shared: Arc<Shared>,
}

impl SimulatedRig {
    pub fn new(config: RigConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::new(config)),
                clock: Arc::new(ManualClock::default()),
            }),
        }
    }

    /// Collaborators for a compensator running against this rig
    pub fn equipment(&self) -> Equipment {
        Equipment {
            camera: Arc::new(SimCamera(self.shared.clone())),
            solver: Arc::new(SimSolver(self.shared.clone())),
            guider: Arc::new(SimGuider(self.shared.clone())),
            mount: Arc::new(SimMount(self.shared.clone())),
            filter_wheel: Arc::new(SimFilterWheel(self.shared.clone())),
            focuser: Arc::new(SimFocuser(self.shared.clone())),
            status: Arc::new(LogStatusSink),
            clock: self.shared.clock.clone(),
        }
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.shared.clock.clone()
    }

    /// Let simulated time pass
    pub fn advance(&self, secs: f64) {
        self.shared.advance(secs);
    }

    /// Simulated time since the start in hours
    pub fn elapsed_hours(&self) -> f64 {
        self.shared.state.lock().unwrap().elapsed_hours
    }

    /// True centre of the imaging field, without solve noise
    pub fn imaging_pointing(&self) -> Equatorial {
        let state = self.shared.state.lock().unwrap();
        let (ra, dec) = state.imaging_offset();
        state.config.field.offset_arcsec(ra, dec)
    }

    /// Drift rate of the imaging field left after the shift rate, arcsec/hr
    pub fn residual_rate(&self) -> (f64, f64) {
        let state = self.shared.state.lock().unwrap();
        let flexure = state.flexure_rate();
        (flexure.0 + state.shift_rate.0, flexure.1 + state.shift_rate.1)
    }

    /// Shift rate the guider is applying, arcsec/hr
    pub fn applied_shift_rate(&self) -> (f64, f64) {
        self.shared.state.lock().unwrap().shift_rate
    }

    /// Move the lock position by guide pixels and let the mount follow
    pub fn dither(&self, dx_px: f64, dy_px: f64) {
        let mut state = self.shared.state.lock().unwrap();
        let scale = state.config.guide_pixel_scale;
        let cos_dec = state.cos_dec();
        state.lock.0 += dx_px;
        state.lock.1 += dy_px;
        state.static_offset.0 += dx_px * scale / cos_dec;
        state.static_offset.1 += dy_px * scale;
        debug!("Dithered by {:.2} | {:.2} px", dx_px, dy_px);
    }

    /// Flip the telescope; flexure reverses direction from here on
    pub fn meridian_flip(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.flexure_base = state.flexure_offset();
        state.flexure_origin_hours = state.elapsed_hours;
        state.flexure_sign = -state.flexure_sign;
        info!("Meridian flip at {:.3} h", state.elapsed_hours);
    }

    /// Select a filter; slots are wedged so each one shifts the field in Dec
    pub fn select_filter(&self, filter: FilterInfo) {
        let mut state = self.shared.state.lock().unwrap();
        let from = state.filter.as_ref().map_or(0, |f| f.position);
        let wedge = (f64::from(filter.position) - f64::from(from)) * state.config.filter_wedge_arcsec;
        state.static_offset.1 += wedge;
        debug!("Filter {} selected, field moved {:.2} arcsec", filter.name, wedge);
        state.filter = Some(filter);
    }

    pub fn move_focuser(&self, position: i32) {
        self.shared.state.lock().unwrap().focuser_position = position;
    }

    pub fn set_camera_connected(&self, connected: bool) {
        self.shared.state.lock().unwrap().camera_connected = connected;
    }

    /// Make the next `count` solve attempts fail
    pub fn fail_next_solves(&self, count: u32) {
        self.shared.state.lock().unwrap().failing_solves = count;
    }
}

impl std::fmt::Debug for SimulatedRig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SimulatedRig")
            .field("elapsed_hours", &self.elapsed_hours())
            .finish_non_exhaustive()
    }
}

struct SimCamera(Arc<Shared>);

#[async_trait]
impl Camera for SimCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            connected: self.0.state.lock().unwrap().camera_connected,
            default_gain: Some(100),
        }
    }

    async fn capture(
        &self,
        spec: &ExposureSpec,
        token: &CancellationToken,
    ) -> DeviceResult<ExposureHandle> {
        if !self.info().connected {
            return Err(DeviceError::NotConnected);
        }
        tokio::task::yield_now().await;
        if token.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        self.0.advance(spec.exposure_time);
        let mut state = self.0.state.lock().unwrap();
        let handle = ExposureHandle(state.next_handle);
        state.next_handle += 1;
        Ok(handle)
    }

    async fn download(
        &self,
        _handle: ExposureHandle,
        _token: &CancellationToken,
    ) -> DeviceResult<Option<RawExposure>> {
        Ok(Some(RawExposure {
            pixels: Array2::from_elem((FRAME_SIZE, FRAME_SIZE), SKY_BACKGROUND_ADU),
            exposure_start: self.0.clock.now(),
        }))
    }

    fn abort_exposure(&self) {
        debug!("Simulated exposure aborted");
    }
}

/// Solves to the true imaging field plus noise
struct SimSolver(Arc<Shared>);

impl SimSolver {
    fn attempt(&self, parameter: &PlateSolveParameter) -> PlateSolveResult {
        let mut state = self.0.state.lock().unwrap();
        if state.failing_solves > 0 {
            state.failing_solves -= 1;
            return PlateSolveResult::failed();
        }
        let (ra, dec) = state.imaging_offset();
        let (noise_ra, noise_dec) = state.sample_noise();
        PlateSolveResult {
            success: true,
            coordinates: state
                .config
                .field
                .offset_arcsec(ra + noise_ra / state.cos_dec(), dec + noise_dec),
            pixel_scale: state.config.imaging_pixel_scale * f64::from(parameter.binning.max(1)),
        }
    }
}

#[async_trait]
impl PlateSolver for SimSolver {
    async fn solve(
        &self,
        _image: &SolvableImage,
        parameter: &PlateSolveParameter,
        _token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult> {
        Ok(self.attempt(parameter))
    }

    async fn blind_solve(
        &self,
        _image: &SolvableImage,
        parameter: &PlateSolveParameter,
        _token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult> {
        Ok(self.attempt(parameter))
    }
}

struct SimGuider(Arc<Shared>);

#[async_trait]
impl Guider for SimGuider {
    fn info(&self) -> GuiderInfo {
        GuiderInfo {
            connected: true,
            pixel_scale: self.0.state.lock().unwrap().config.guide_pixel_scale,
            can_set_shift_rate: true,
            can_get_lock_position: true,
        }
    }

    fn lock_position(&self) -> Option<LockPosition> {
        let (x, y) = self.0.state.lock().unwrap().lock;
        Some(LockPosition {
            x,
            y,
            event_time: self.0.clock.now(),
        })
    }

    async fn set_shift_rate(
        &self,
        rate: SiderealShiftRate,
        _token: &CancellationToken,
    ) -> DeviceResult<()> {
        self.0.state.lock().unwrap().shift_rate = (
            rate.ra_arcsec_per_sec * 3600.0,
            rate.dec_arcsec_per_sec * 3600.0,
        );
        Ok(())
    }

    async fn stop_shifting(&self, _token: &CancellationToken) -> DeviceResult<()> {
        self.0.state.lock().unwrap().shift_rate = (0.0, 0.0);
        Ok(())
    }
}

struct SimMount(Arc<Shared>);

impl Mount for SimMount {
    fn info(&self) -> MountInfo {
        MountInfo {
            connected: true,
            coordinates: self.0.state.lock().unwrap().config.field,
        }
    }
}

struct SimFilterWheel(Arc<Shared>);

impl FilterWheel for SimFilterWheel {
    fn info(&self) -> FilterWheelInfo {
        FilterWheelInfo {
            connected: true,
            selected_filter: self.0.state.lock().unwrap().filter.clone(),
        }
    }
}

struct SimFocuser(Arc<Shared>);

impl Focuser for SimFocuser {
    fn info(&self) -> FocuserInfo {
        FocuserInfo {
            connected: true,
            position: self.0.state.lock().unwrap().focuser_position,
        }
    }
}

/// Status sink that forwards everything to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn status(&self, update: StatusUpdate) {
        if !update.status.is_empty() {
            debug!("[{}] {}", update.source, update.status);
        }
    }

    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Info => info!("{}", message),
            NotificationLevel::Warning => warn!("{}", message),
            NotificationLevel::Error => error!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::Separation;

    fn quiet_config() -> RigConfig {
        RigConfig {
            solve_noise_arcsec: 0.0,
            ..Default::default()
        }
    }

    fn offset_from_field(rig: &SimulatedRig) -> Separation {
        rig.imaging_pointing() - RigConfig::default().field
    }

    #[test]
    fn test_flexure_moves_imaging_field() {
        let rig = SimulatedRig::new(quiet_config());
        rig.advance(1800.0);
        assert_relative_eq!(offset_from_field(&rig).ra_arcsec(), 6.0, epsilon = 1e-6);
        assert_relative_eq!(rig.elapsed_hours(), 0.5);
    }

    #[tokio::test]
    async fn test_shift_rate_cancels_flexure() {
        let rig = SimulatedRig::new(quiet_config());
        let equipment = rig.equipment();
        equipment
            .guider
            .set_shift_rate(
                SiderealShiftRate {
                    ra_arcsec_per_sec: -12.0 / 3600.0,
                    dec_arcsec_per_sec: 0.0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let start = equipment.guider.lock_position().unwrap();
        rig.advance(3600.0);

        assert_relative_eq!(offset_from_field(&rig).ra_arcsec(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(rig.residual_rate().0, 0.0, epsilon = 1e-9);

        // Lock moved by the on-sky shift in guide pixels
        let end = equipment.guider.lock_position().unwrap();
        let expected = 12.0 * RigConfig::default().field.dec.cos() / 2.0;
        assert_relative_eq!((end.x - start.x).abs(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_meridian_flip_reverses_flexure() {
        let rig = SimulatedRig::new(quiet_config());
        rig.advance(3600.0);
        rig.meridian_flip();
        assert_eq!(rig.residual_rate(), (-12.0, 0.0));
        rig.advance(1800.0);
        assert_relative_eq!(offset_from_field(&rig).ra_arcsec(), 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dither_moves_lock_and_field() {
        let rig = SimulatedRig::new(quiet_config());
        let before = rig.equipment().guider.lock_position().unwrap();
        rig.dither(0.0, 3.0);
        let after = rig.equipment().guider.lock_position().unwrap();
        assert_relative_eq!(after.y - before.y, 3.0);
        assert_relative_eq!(offset_from_field(&rig).dec_arcsec(), 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_filter_wedge() {
        let rig = SimulatedRig::new(quiet_config());
        rig.select_filter(FilterInfo::new("R", 2));
        assert_relative_eq!(offset_from_field(&rig).dec_arcsec(), 3.0, epsilon = 1e-6);
        rig.select_filter(FilterInfo::new("G", 1));
        assert_relative_eq!(offset_from_field(&rig).dec_arcsec(), 1.5, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_camera_advances_clock() {
        let rig = SimulatedRig::new(quiet_config());
        let equipment = rig.equipment();
        let t0 = equipment.clock.now();
        let spec = ExposureSpec {
            exposure_time: 5.0,
            image_type: flexure::equipment::ImageType::Snapshot,
            binning: Default::default(),
            gain: None,
            filter: None,
        };
        let token = CancellationToken::new();
        let handle = equipment.camera.capture(&spec, &token).await.unwrap();
        let raw = equipment.camera.download(handle, &token).await.unwrap();

        assert!(raw.is_some());
        assert_eq!((equipment.clock.now() - t0).num_seconds(), 5);
    }

    #[tokio::test]
    async fn test_scripted_solve_failures() {
        let rig = SimulatedRig::new(quiet_config());
        rig.fail_next_solves(1);
        let solver = SimSolver(rig.shared.clone());
        let parameter = PlateSolveParameter {
            binning: 2,
            coordinates: None,
            focal_length_mm: 0.0,
            pixel_size_um: 0.0,
            search_radius_deg: 30.0,
            max_objects: 500,
            regions: 5000,
            blind_failover_enabled: true,
        };
        assert!(!solver.attempt(&parameter).success);
        let solved = solver.attempt(&parameter);
        assert!(solved.success);
        assert_relative_eq!(solved.pixel_scale, 2.0);
    }
}
