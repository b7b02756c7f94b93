//! Sample acquisition
//!
//! Takes one reference snapshot through the imaging camera and returns it
//! with its metadata. Captures from every compensator sharing a
//! [`CaptureGate`] are serialized, so the camera never sees two requests at
//! once.

use crate::equipment::{
    BinningMode, Camera, DeviceError, DeviceResult, Equipment, ExposureMetadata, ExposureSpec,
    FilterWheel, Focuser, ImageType, Mount, NotificationLevel, RawExposure, SolvableImage,
    StatusSink, StatusUpdate,
};
use crate::error::{FlexureError, FlexureResult};
use log::{debug, error, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Source tag for status updates
pub const STATUS_SOURCE: &str = "Flexure Compensator";

/// Gain setting meaning "use the camera default"
pub const DEFAULT_GAIN: i32 = -1;

/// Single-slot gate around capture and download
#[derive(Debug, Clone)]
pub struct CaptureGate {
    slot: Arc<Semaphore>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether a capture currently holds the slot
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl Default for CaptureGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the configured gain against the camera default
pub fn resolve_gain(setting: i32, camera_default: Option<i32>) -> i32 {
    if setting == DEFAULT_GAIN {
        camera_default.unwrap_or(0)
    } else {
        setting
    }
}

/// Report a status line, tagging it with the compensator as source
pub fn report_status(sink: &dyn StatusSink, status: &str) {
    sink.status(StatusUpdate {
        source: STATUS_SOURCE.to_string(),
        status: status.to_string(),
    });
}

async fn cancellable<T>(
    token: &CancellationToken,
    operation: impl Future<Output = DeviceResult<T>>,
) -> DeviceResult<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DeviceError::Cancelled),
        result = operation => result,
    }
}

/// Captures reference exposures through the imaging camera
#[derive(Clone)]
pub struct SampleAcquirer {
    camera: Arc<dyn Camera>,
    mount: Arc<dyn Mount>,
    filter_wheel: Arc<dyn FilterWheel>,
    focuser: Arc<dyn Focuser>,
    status: Arc<dyn StatusSink>,
    gate: CaptureGate,
}

impl SampleAcquirer {
    pub fn new(equipment: &Equipment, gate: CaptureGate) -> Self {
        Self {
            camera: equipment.camera.clone(),
            mount: equipment.mount.clone(),
            filter_wheel: equipment.filter_wheel.clone(),
            focuser: equipment.focuser.clone(),
            status: equipment.status.clone(),
            gate,
        }
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    /// Snapshot request at the given binning and exposure, keeping the current filter
    pub fn reference_exposure(
        &self,
        binning: BinningMode,
        exposure_secs: f64,
        gain_setting: i32,
    ) -> ExposureSpec {
        ExposureSpec {
            exposure_time: exposure_secs,
            image_type: ImageType::Snapshot,
            binning,
            gain: Some(resolve_gain(gain_setting, self.camera.info().default_gain)),
            filter: None,
        }
    }

    /// Capture and download one exposure.
    ///
    /// Returns `Ok(None)` when the camera delivered no image.
    pub async fn capture_image(
        &self,
        spec: &ExposureSpec,
        token: &CancellationToken,
    ) -> FlexureResult<Option<SolvableImage>> {
        report_status(self.status.as_ref(), "Waiting for camera");
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FlexureError::Cancelled),
            permit = self.gate.slot.acquire() => {
                permit.map_err(|_| FlexureError::Device("capture gate closed".to_string()))
            }
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                report_status(self.status.as_ref(), "");
                return Err(e);
            }
        };

        let result = self.capture_exclusive(spec, token).await;

        report_status(self.status.as_ref(), "");
        drop(permit);
        result
    }

    async fn capture_exclusive(
        &self,
        spec: &ExposureSpec,
        token: &CancellationToken,
    ) -> FlexureResult<Option<SolvableImage>> {
        if !self.camera.is_connected() {
            warn!("No camera connected");
            self.status
                .notify(NotificationLevel::Warning, "No camera connected");
            return Err(FlexureError::CameraNotConnected);
        }

        debug!(
            "Starting exposure for solving - binning {} gain {:?} exposure {}s",
            spec.binning, spec.gain, spec.exposure_time
        );
        let handle = cancellable(token, self.camera.capture(spec, token))
            .await
            .map_err(|e| self.capture_failure(e))?;

        report_status(self.status.as_ref(), "Downloading");
        let raw = cancellable(token, self.camera.download(handle, token))
            .await
            .map_err(|e| self.capture_failure(e))?;

        if token.is_cancelled() {
            self.camera.abort_exposure();
            return Err(FlexureError::Cancelled);
        }

        match raw {
            Some(raw) => Ok(Some(self.with_metadata(raw, spec))),
            None => {
                let message = format!(
                    "Camera download failed: {}s {} gain {:?} {}",
                    spec.exposure_time,
                    spec.image_type,
                    spec.gain,
                    spec.filter.as_ref().map(|f| f.name.as_str()).unwrap_or("")
                );
                error!("{}", message);
                self.status.notify(NotificationLevel::Error, &message);
                Ok(None)
            }
        }
    }

    /// Map a camera failure to a cycle error, aborting the exposure where needed
    fn capture_failure(&self, err: DeviceError) -> FlexureError {
        match err {
            DeviceError::Cancelled => {
                debug!("Capture cancelled, aborting exposure");
                self.camera.abort_exposure();
                FlexureError::Cancelled
            }
            DeviceError::ExposureFailed(message) => {
                error!("{}", message);
                self.status.notify(NotificationLevel::Error, &message);
                FlexureError::ExposureFailed(message)
            }
            DeviceError::ConnectionLost | DeviceError::NotConnected => {
                error!("Camera connection lost");
                self.status
                    .notify(NotificationLevel::Error, "Camera connection lost");
                FlexureError::CameraConnectionLost
            }
            DeviceError::Other(message) => {
                error!("Unexpected camera error: {}", message);
                self.status.notify(
                    NotificationLevel::Error,
                    &format!("Unexpected error\n{message}"),
                );
                self.camera.abort_exposure();
                FlexureError::Device(message)
            }
        }
    }

    fn with_metadata(&self, raw: RawExposure, spec: &ExposureSpec) -> SolvableImage {
        let mount = self.mount.info();
        let wheel = self.filter_wheel.info();
        let focuser = self.focuser.info();

        let telescope_coordinates = mount
            .connected
            .then_some(mount.coordinates)
            .filter(|c| c.is_finite());
        let filter = spec
            .filter
            .clone()
            .or_else(|| wheel.connected.then_some(wheel.selected_filter).flatten());

        let metadata = ExposureMetadata {
            binning: spec.binning,
            exposure_time: spec.exposure_time,
            image_type: Some(spec.image_type),
            gain: spec.gain,
            telescope_coordinates,
            target_coordinates: telescope_coordinates,
            filter,
            focuser_position: focuser.connected.then_some(focuser.position),
        };

        SolvableImage {
            pixels: raw.pixels,
            exposure_start: raw.exposure_start,
            metadata,
        }
    }
}

impl std::fmt::Debug for SampleAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SampleAcquirer")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
