//! Mock equipment for testing

use crate::equipment::{
    Camera, CameraInfo, DeviceError, DeviceResult, Equipment, ExposureHandle, ExposureSpec,
    FilterInfo, FilterWheel, FilterWheelInfo, Focuser, FocuserInfo, Guider, GuiderInfo,
    LockPosition, Mount, MountInfo, NotificationLevel, PlateSolveParameter, PlateSolveResult,
    PlateSolver, RawExposure, SiderealShiftRate, SolvableImage, StatusSink, StatusUpdate,
};
use async_trait::async_trait;
use ndarray::Array2;
use shared::{Clock, Equatorial, ManualClock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the next capture does
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Deliver a blank frame
    Image,
    /// Capture succeeds but the download yields nothing
    EmptyDownload,
    /// Capture fails
    Fail(DeviceError),
    /// Capture succeeds, download fails
    FailDownload(DeviceError),
}

/// Mock imaging camera with scripted outcomes
pub struct MockCamera {
    connected: AtomicBool,
    default_gain: Mutex<Option<i32>>,
    outcomes: Mutex<VecDeque<CaptureOutcome>>,
    pending: Mutex<Option<CaptureOutcome>>,
    delay: Mutex<Duration>,
    clock: Arc<dyn Clock>,
    next_handle: AtomicU64,
    captures: AtomicUsize,
    aborts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_spec: Mutex<Option<ExposureSpec>>,
}

impl MockCamera {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            connected: AtomicBool::new(true),
            default_gain: Mutex::new(None),
            outcomes: Mutex::new(VecDeque::new()),
            pending: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            clock,
            next_handle: AtomicU64::new(1),
            captures: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_default_gain(&self, gain: Option<i32>) {
        *self.default_gain.lock().unwrap() = gain;
    }

    /// Time each capture takes
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Queue the outcome of a future capture. Captures with nothing queued deliver an image.
    pub fn push_outcome(&self, outcome: CaptureOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Highest number of captures that were in progress at once
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<ExposureSpec> {
        self.last_spec.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            connected: self.connected.load(Ordering::SeqCst),
            default_gain: *self.default_gain.lock().unwrap(),
        }
    }

    async fn capture(
        &self,
        spec: &ExposureSpec,
        token: &CancellationToken,
    ) -> DeviceResult<ExposureHandle> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        *self.last_spec.lock().unwrap() = Some(spec.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CaptureOutcome::Image);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(DeviceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }

        if let CaptureOutcome::Fail(err) = outcome {
            return Err(err);
        }
        *self.pending.lock().unwrap() = Some(outcome);
        Ok(ExposureHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn download(
        &self,
        _handle: ExposureHandle,
        _token: &CancellationToken,
    ) -> DeviceResult<Option<RawExposure>> {
        match self.pending.lock().unwrap().take() {
            Some(CaptureOutcome::EmptyDownload) => Ok(None),
            Some(CaptureOutcome::FailDownload(err)) => Err(err),
            Some(_) => Ok(Some(RawExposure {
                pixels: Array2::zeros((16, 16)),
                exposure_start: self.clock.now(),
            })),
            None => Err(DeviceError::Other("nothing to download".to_string())),
        }
    }

    fn abort_exposure(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// What the next solve returns
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    /// Solved at the coordinates with the given arcsec/px scale
    Solved(Equatorial, f64),
    NoSolution,
    Error(DeviceError),
}

/// Mock plate solver returning queued outcomes for hinted and blind solves alike
pub struct MockSolver {
    outcomes: Mutex<VecDeque<SolveOutcome>>,
    fallback: Mutex<SolveOutcome>,
    solves: AtomicUsize,
    blind_solves: AtomicUsize,
    last_parameter: Mutex<Option<PlateSolveParameter>>,
}

impl MockSolver {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(SolveOutcome::NoSolution),
            solves: AtomicUsize::new(0),
            blind_solves: AtomicUsize::new(0),
            last_parameter: Mutex::new(None),
        }
    }

    pub fn push(&self, outcome: SolveOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Outcome used once the queue is empty
    pub fn set_fallback(&self, outcome: SolveOutcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn solve_calls(&self) -> usize {
        self.solves.load(Ordering::SeqCst)
    }

    pub fn blind_calls(&self) -> usize {
        self.blind_solves.load(Ordering::SeqCst)
    }

    pub fn last_parameter(&self) -> Option<PlateSolveParameter> {
        self.last_parameter.lock().unwrap().clone()
    }

    fn next(&self, parameter: &PlateSolveParameter) -> DeviceResult<PlateSolveResult> {
        *self.last_parameter.lock().unwrap() = Some(parameter.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        match outcome {
            SolveOutcome::Solved(coordinates, pixel_scale) => Ok(PlateSolveResult {
                success: true,
                coordinates,
                pixel_scale,
            }),
            SolveOutcome::NoSolution => Ok(PlateSolveResult::failed()),
            SolveOutcome::Error(err) => Err(err),
        }
    }
}

impl Default for MockSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlateSolver for MockSolver {
    async fn solve(
        &self,
        _image: &SolvableImage,
        parameter: &PlateSolveParameter,
        _token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult> {
        self.solves.fetch_add(1, Ordering::SeqCst);
        self.next(parameter)
    }

    async fn blind_solve(
        &self,
        _image: &SolvableImage,
        parameter: &PlateSolveParameter,
        _token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult> {
        self.blind_solves.fetch_add(1, Ordering::SeqCst);
        self.next(parameter)
    }
}

/// Mock guider recording every rate command
pub struct MockGuider {
    info: Mutex<GuiderInfo>,
    lock_position: Mutex<Option<LockPosition>>,
    rates: Mutex<Vec<SiderealShiftRate>>,
    stops: AtomicUsize,
    fail_commands: AtomicBool,
}

impl MockGuider {
    /// Connected guider with the given pixel scale and full shift support
    pub fn new(pixel_scale: f64) -> Self {
        Self {
            info: Mutex::new(GuiderInfo {
                connected: true,
                pixel_scale,
                can_set_shift_rate: true,
                can_get_lock_position: true,
            }),
            lock_position: Mutex::new(None),
            rates: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            fail_commands: AtomicBool::new(false),
        }
    }

    pub fn set_info(&self, info: GuiderInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn set_pixel_scale(&self, pixel_scale: f64) {
        self.info.lock().unwrap().pixel_scale = pixel_scale;
    }

    pub fn set_lock_position(&self, position: Option<LockPosition>) {
        *self.lock_position.lock().unwrap() = position;
    }

    /// Make rate and stop commands fail
    pub fn fail_rate_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Every rate successfully set, oldest first
    pub fn applied_rates(&self) -> Vec<SiderealShiftRate> {
        self.rates.lock().unwrap().clone()
    }

    pub fn last_rate(&self) -> Option<SiderealShiftRate> {
        self.rates.lock().unwrap().last().copied()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Guider for MockGuider {
    fn info(&self) -> GuiderInfo {
        self.info.lock().unwrap().clone()
    }

    fn lock_position(&self) -> Option<LockPosition> {
        *self.lock_position.lock().unwrap()
    }

    async fn set_shift_rate(
        &self,
        rate: SiderealShiftRate,
        _token: &CancellationToken,
    ) -> DeviceResult<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(DeviceError::Other("guider rejected shift rate".to_string()));
        }
        self.rates.lock().unwrap().push(rate);
        Ok(())
    }

    async fn stop_shifting(&self, _token: &CancellationToken) -> DeviceResult<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(DeviceError::Other("guider rejected stop".to_string()));
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock mount
pub struct MockMount {
    info: Mutex<MountInfo>,
}

impl MockMount {
    pub fn new(coordinates: Equatorial) -> Self {
        Self {
            info: Mutex::new(MountInfo {
                connected: true,
                coordinates,
            }),
        }
    }

    pub fn set_coordinates(&self, coordinates: Equatorial) {
        self.info.lock().unwrap().coordinates = coordinates;
    }

    pub fn set_connected(&self, connected: bool) {
        self.info.lock().unwrap().connected = connected;
    }
}

impl Mount for MockMount {
    fn info(&self) -> MountInfo {
        self.info.lock().unwrap().clone()
    }
}

/// Mock filter wheel, disconnected until a filter is selected
#[derive(Default)]
pub struct MockFilterWheel {
    info: Mutex<FilterWheelInfo>,
}

impl MockFilterWheel {
    /// Connect the wheel with `filter` in place
    pub fn select(&self, filter: Option<FilterInfo>) {
        let mut info = self.info.lock().unwrap();
        info.connected = true;
        info.selected_filter = filter;
    }

    pub fn set_connected(&self, connected: bool) {
        self.info.lock().unwrap().connected = connected;
    }
}

impl FilterWheel for MockFilterWheel {
    fn info(&self) -> FilterWheelInfo {
        self.info.lock().unwrap().clone()
    }
}

/// Mock focuser, disconnected until a position is set
#[derive(Default)]
pub struct MockFocuser {
    info: Mutex<FocuserInfo>,
}

impl MockFocuser {
    /// Connect the focuser at `position`
    pub fn set_position(&self, position: i32) {
        let mut info = self.info.lock().unwrap();
        info.connected = true;
        info.position = position;
    }

    pub fn set_connected(&self, connected: bool) {
        self.info.lock().unwrap().connected = connected;
    }
}

impl Focuser for MockFocuser {
    fn info(&self) -> FocuserInfo {
        self.info.lock().unwrap().clone()
    }
}

/// Status sink that keeps everything it is sent
#[derive(Default)]
pub struct RecordingStatusSink {
    updates: Mutex<Vec<StatusUpdate>>,
    notifications: Mutex<Vec<(NotificationLevel, String)>>,
}

impl RecordingStatusSink {
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Status strings in the order they were reported
    pub fn statuses(&self) -> Vec<String> {
        self.updates().into_iter().map(|u| u.status).collect()
    }

    pub fn notifications(&self) -> Vec<(NotificationLevel, String)> {
        self.notifications.lock().unwrap().clone()
    }

    fn messages(&self, level: NotificationLevel) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages(NotificationLevel::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(NotificationLevel::Error)
    }
}

impl StatusSink for RecordingStatusSink {
    fn status(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }

    fn notify(&self, level: NotificationLevel, message: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

/// A full set of connected mock equipment sharing one manual clock
pub struct MockRig {
    pub camera: Arc<MockCamera>,
    pub solver: Arc<MockSolver>,
    pub guider: Arc<MockGuider>,
    pub mount: Arc<MockMount>,
    pub filter_wheel: Arc<MockFilterWheel>,
    pub focuser: Arc<MockFocuser>,
    pub status: Arc<RecordingStatusSink>,
    pub clock: Arc<ManualClock>,
}

impl MockRig {
    /// Camera, guider (1 arcsec/px) and mount connected; filter wheel and focuser not
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            camera: Arc::new(MockCamera::new(clock.clone())),
            solver: Arc::new(MockSolver::new()),
            guider: Arc::new(MockGuider::new(1.0)),
            mount: Arc::new(MockMount::new(Equatorial::from_degrees(150.0, 30.0))),
            filter_wheel: Arc::new(MockFilterWheel::default()),
            focuser: Arc::new(MockFocuser::default()),
            status: Arc::new(RecordingStatusSink::default()),
            clock,
        }
    }

    pub fn equipment(&self) -> Equipment {
        Equipment {
            camera: self.camera.clone(),
            solver: self.solver.clone(),
            guider: self.guider.clone(),
            mount: self.mount.clone(),
            filter_wheel: self.filter_wheel.clone(),
            focuser: self.focuser.clone(),
            status: self.status.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new()
    }
}
