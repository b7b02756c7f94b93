//! Equipment abstraction layer for the flexure compensator
//!
//! The compensator never talks to hardware directly. Everything it needs from
//! the outside world (imaging camera, plate solver, guider, mount, filter
//! wheel, focuser and a status display) is reached through the narrow traits
//! in this module, which can be backed by real drivers, the simulation
//! harness, or the mocks in [`crate::mock_equipment`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use shared::{Clock, Equatorial};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for collaborator operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device is not connected
    #[error("device not connected")]
    NotConnected,
    /// Device dropped its connection mid-operation
    #[error("connection lost")]
    ConnectionLost,
    /// Camera reported a failed exposure
    #[error("exposure failed: {0}")]
    ExposureFailed(String),
    /// Operation was cancelled through its token
    #[error("cancelled")]
    Cancelled,
    /// Anything else the driver reports
    #[error("{0}")]
    Other(String),
}

/// Result type for collaborator operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Camera binning mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinningMode {
    pub x: u16,
    pub y: u16,
}

impl BinningMode {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

impl Default for BinningMode {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for BinningMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Kind of exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    Light,
    Dark,
    Flat,
    Bias,
    Snapshot,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Light => "LIGHT",
            ImageType::Dark => "DARK",
            ImageType::Flat => "FLAT",
            ImageType::Bias => "BIAS",
            ImageType::Snapshot => "SNAPSHOT",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter wheel slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub name: String,
    pub position: u16,
}

impl FilterInfo {
    pub fn new(name: impl Into<String>, position: u16) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// Request for a single exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureSpec {
    /// Exposure time in seconds
    pub exposure_time: f64,
    pub image_type: ImageType,
    pub binning: BinningMode,
    /// Gain to use, `None` for the camera default
    pub gain: Option<i32>,
    /// Filter to switch to before exposing, `None` to keep the current one
    pub filter: Option<FilterInfo>,
}

/// Opaque handle to an exposure in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureHandle(pub u64);

/// Pixel data as delivered by the camera
#[derive(Debug, Clone)]
pub struct RawExposure {
    pub pixels: Array2<u16>,
    /// Time the shutter opened
    pub exposure_start: DateTime<Utc>,
}

/// Metadata attached to a downloaded exposure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureMetadata {
    pub binning: BinningMode,
    pub exposure_time: f64,
    pub image_type: Option<ImageType>,
    pub gain: Option<i32>,
    /// Mount coordinates at download time
    pub telescope_coordinates: Option<Equatorial>,
    /// Target coordinates, defaulting to the mount coordinates
    pub target_coordinates: Option<Equatorial>,
    pub filter: Option<FilterInfo>,
    pub focuser_position: Option<i32>,
}

/// A downloaded exposure with its metadata, ready for plate solving
#[derive(Debug, Clone)]
pub struct SolvableImage {
    pub pixels: Array2<u16>,
    pub exposure_start: DateTime<Utc>,
    pub metadata: ExposureMetadata,
}

/// Camera status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraInfo {
    pub connected: bool,
    /// Gain the camera uses when none is requested
    pub default_gain: Option<i32>,
}

/// Imaging camera
#[async_trait]
pub trait Camera: Send + Sync {
    /// Current camera status
    fn info(&self) -> CameraInfo;

    /// Whether the camera is connected
    fn is_connected(&self) -> bool {
        self.info().connected
    }

    /// Start an exposure and wait for the shutter to close
    async fn capture(
        &self,
        spec: &ExposureSpec,
        token: &CancellationToken,
    ) -> DeviceResult<ExposureHandle>;

    /// Download a finished exposure, `None` if the download produced no image
    async fn download(
        &self,
        handle: ExposureHandle,
        token: &CancellationToken,
    ) -> DeviceResult<Option<RawExposure>>;

    /// Abort any exposure in progress
    fn abort_exposure(&self);
}

/// Parameters handed to the plate solver
#[derive(Debug, Clone, PartialEq)]
pub struct PlateSolveParameter {
    pub binning: u16,
    /// Approximate field centre
    pub coordinates: Option<Equatorial>,
    /// Telescope focal length in millimetres
    pub focal_length_mm: f64,
    /// Camera pixel size in micrometres
    pub pixel_size_um: f64,
    /// Search radius around `coordinates` in degrees
    pub search_radius_deg: f64,
    pub max_objects: u32,
    pub regions: u32,
    pub blind_failover_enabled: bool,
}

impl PlateSolveParameter {
    /// Expected image scale in arcsec per (binned) pixel
    pub fn pixel_scale_hint(&self) -> f64 {
        if self.focal_length_mm <= 0.0 {
            return f64::NAN;
        }
        206.265 * self.pixel_size_um * f64::from(self.binning.max(1)) / self.focal_length_mm
    }
}

/// Raw answer from the plate solver
#[derive(Debug, Clone, PartialEq)]
pub struct PlateSolveResult {
    pub success: bool,
    pub coordinates: Equatorial,
    /// Solved image scale in arcsec per pixel
    pub pixel_scale: f64,
}

impl PlateSolveResult {
    /// A result describing a failed solve
    pub fn failed() -> Self {
        Self {
            success: false,
            coordinates: Equatorial::new(f64::NAN, f64::NAN),
            pixel_scale: f64::NAN,
        }
    }
}

/// Astrometric plate solver
#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// Solve near the hinted coordinates
    async fn solve(
        &self,
        image: &SolvableImage,
        parameter: &PlateSolveParameter,
        token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult>;

    /// Solve without a position hint
    async fn blind_solve(
        &self,
        image: &SolvableImage,
        parameter: &PlateSolveParameter,
        token: &CancellationToken,
    ) -> DeviceResult<PlateSolveResult>;
}

/// Guide star lock position reported by the guider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockPosition {
    /// X in guide camera pixels
    pub x: f64,
    /// Y in guide camera pixels
    pub y: f64,
    /// When the guider reported this position
    pub event_time: DateTime<Utc>,
}

impl fmt::Display for LockPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "x={:.3} y={:.3} @ {}", self.x, self.y, self.event_time)
    }
}

/// Guider status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuiderInfo {
    pub connected: bool,
    /// Guide camera image scale in arcsec per pixel, <= 0 when unknown
    pub pixel_scale: f64,
    pub can_set_shift_rate: bool,
    pub can_get_lock_position: bool,
}

/// Lock position shift rate in the guider's native units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SiderealShiftRate {
    /// RA shift in arcseconds of RA per second
    pub ra_arcsec_per_sec: f64,
    /// Dec shift in arcseconds per second
    pub dec_arcsec_per_sec: f64,
}

/// Autoguider
#[async_trait]
pub trait Guider: Send + Sync {
    fn info(&self) -> GuiderInfo;

    /// Current lock position, `None` if the guider cannot report one
    fn lock_position(&self) -> Option<LockPosition>;

    /// Start moving the lock position at the given rate
    async fn set_shift_rate(
        &self,
        rate: SiderealShiftRate,
        token: &CancellationToken,
    ) -> DeviceResult<()>;

    /// Stop moving the lock position
    async fn stop_shifting(&self, token: &CancellationToken) -> DeviceResult<()>;
}

/// Mount status
#[derive(Debug, Clone, PartialEq)]
pub struct MountInfo {
    pub connected: bool,
    pub coordinates: Equatorial,
}

/// Telescope mount
pub trait Mount: Send + Sync {
    fn info(&self) -> MountInfo;

    /// Where the mount is currently pointing
    fn current_position(&self) -> Equatorial {
        self.info().coordinates
    }
}

/// Filter wheel status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterWheelInfo {
    pub connected: bool,
    pub selected_filter: Option<FilterInfo>,
}

/// Filter wheel
pub trait FilterWheel: Send + Sync {
    fn info(&self) -> FilterWheelInfo;
}

/// Focuser status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FocuserInfo {
    pub connected: bool,
    /// Absolute position in steps
    pub position: i32,
}

/// Focuser
pub trait Focuser: Send + Sync {
    fn info(&self) -> FocuserInfo;
}

/// Severity of a user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Progress line for the application status bar
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub source: String,
    /// Empty string clears the status
    pub status: String,
}

/// Destination for status lines and user notifications.
///
/// Implementations must never fail or block; a lost message is acceptable.
pub trait StatusSink: Send + Sync {
    fn status(&self, update: StatusUpdate);
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// Status sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn status(&self, _update: StatusUpdate) {}
    fn notify(&self, _level: NotificationLevel, _message: &str) {}
}

/// Everything the compensator needs from the outside world
#[derive(Clone)]
pub struct Equipment {
    pub camera: Arc<dyn Camera>,
    pub solver: Arc<dyn PlateSolver>,
    pub guider: Arc<dyn Guider>,
    pub mount: Arc<dyn Mount>,
    pub filter_wheel: Arc<dyn FilterWheel>,
    pub focuser: Arc<dyn Focuser>,
    pub status: Arc<dyn StatusSink>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Equipment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Equipment").finish_non_exhaustive()
    }
}
