//! Runner for driving the compensator through an imaging sequence
//!
//! Plays the part of the host sequencer: asks the compensator whether it
//! wants to run around every exposure, lets simulated time pass during
//! light frames, and publishes dither and meridian flip events.

use crate::rig::SimulatedRig;
use flexure::equipment::{BinningMode, FilterInfo, ImageType};
use flexure::{DriftSnapshot, EquipmentEvent, ExposureItem, FlexureCompensator, FlexureResult, ShiftRate};
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long to wait for the compensator to process a published event
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One step of a scripted imaging sequence
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceStep {
    Light { exposure_secs: f64, binning: BinningMode },
    Dark { exposure_secs: f64 },
    ChangeFilter(FilterInfo),
    Refocus(i32),
    /// Dither by guide pixels
    Dither { dx_px: f64, dy_px: f64 },
    MeridianFlip,
}

impl SequenceStep {
    pub fn light(exposure_secs: f64) -> Self {
        SequenceStep::Light {
            exposure_secs,
            binning: BinningMode::default(),
        }
    }

    /// `count` identical light frames
    pub fn lights(count: usize, exposure_secs: f64) -> Vec<Self> {
        vec![Self::light(exposure_secs); count]
    }
}

/// What happened during one light frame
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    /// Light frame number, starting at 1
    pub index: usize,
    /// Simulated time at the end of the frame in hours
    pub elapsed_hours: f64,
    /// Compensator shift rate during the frame, arcsec/hr
    pub shift_rate: ShiftRate,
    /// Imaging drift left uncorrected, (ra, dec) arcsec/hr
    pub residual_rate: (f64, f64),
    /// On-sky distance the imaging field moved during the frame, arcsec
    pub smear_arcsec: f64,
}

/// Results from a runner execution
#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub records: Vec<ExposureRecord>,
    /// Compensator state after the last step
    pub final_snapshot: DriftSnapshot,
}

impl SequenceReport {
    pub fn last(&self) -> Option<&ExposureRecord> {
        self.records.last()
    }
}

/// Run `steps` against the rig.
///
/// The compensator is initialised for the sequence block first and torn
/// down afterwards, even if a cycle fails.
pub async fn run_sequence(
    compensator: &FlexureCompensator,
    rig: &SimulatedRig,
    steps: &[SequenceStep],
    token: &CancellationToken,
) -> FlexureResult<SequenceReport> {
    compensator.block_initialize().await;
    let mut records = Vec::new();
    let result = run_steps(compensator, rig, steps, token, &mut records).await;
    compensator.block_teardown().await;
    if let Err(e) = &result {
        if e.is_cancelled() {
            info!("Sequence cancelled after {} light frames", records.len());
        } else {
            warn!("Sequence aborted after {} light frames: {}", records.len(), e);
        }
    }
    result?;

    Ok(SequenceReport {
        records,
        final_snapshot: compensator.snapshot(),
    })
}

async fn run_steps(
    compensator: &FlexureCompensator,
    rig: &SimulatedRig,
    steps: &[SequenceStep],
    token: &CancellationToken,
    records: &mut Vec<ExposureRecord>,
) -> FlexureResult<()> {
    for step in steps {
        match step {
            SequenceStep::Light {
                exposure_secs,
                binning,
            } => {
                let item = ExposureItem::light(*exposure_secs, *binning);
                let record = expose(compensator, rig, &item, token).await?;
                if let Some(mut record) = record {
                    record.index = records.len() + 1;
                    debug!(
                        "Light {} done, residual {:.2} | {:.2} arcsec/hr",
                        record.index, record.residual_rate.0, record.residual_rate.1
                    );
                    records.push(record);
                }
            }
            SequenceStep::Dark { exposure_secs } => {
                let item = ExposureItem {
                    image_type: ImageType::Dark,
                    binning: BinningMode::default(),
                    exposure_time: *exposure_secs,
                };
                expose(compensator, rig, &item, token).await?;
            }
            SequenceStep::ChangeFilter(filter) => rig.select_filter(filter.clone()),
            SequenceStep::Refocus(position) => rig.move_focuser(*position),
            SequenceStep::Dither { dx_px, dy_px } => {
                rig.dither(*dx_px, *dy_px);
                publish_and_wait(compensator, EquipmentEvent::DitherCompleted).await;
            }
            SequenceStep::MeridianFlip => {
                rig.meridian_flip();
                publish_and_wait(compensator, EquipmentEvent::MeridianFlipCompleted).await;
            }
        }
    }
    Ok(())
}

/// One exposure with the trigger calls a sequencer makes around it
async fn expose(
    compensator: &FlexureCompensator,
    rig: &SimulatedRig,
    item: &ExposureItem,
    token: &CancellationToken,
) -> FlexureResult<Option<ExposureRecord>> {
    if compensator.should_trigger(item).await {
        compensator.execute(token).await?;
    }

    let start = rig.imaging_pointing();
    let shift_rate = compensator.snapshot().shift_rate;
    let residual_rate = rig.residual_rate();
    rig.advance(item.exposure_time);
    let smear_arcsec = (rig.imaging_pointing() - start).distance_arcsec();
    let elapsed_hours = rig.elapsed_hours();

    if compensator.should_trigger_after(item).await {
        compensator.execute(token).await?;
    }

    Ok(item.is_light().then_some(ExposureRecord {
        index: 0,
        elapsed_hours,
        shift_rate,
        residual_rate,
        smear_arcsec,
    }))
}

async fn publish_and_wait(compensator: &FlexureCompensator, event: EquipmentEvent) {
    let mut rx = compensator.subscribe_state();
    rx.borrow_and_update();
    if compensator.event_bus().publish(event.clone()) == 0 {
        warn!("Nobody is listening for {:?}", event);
        return;
    }
    match tokio::time::timeout(EVENT_TIMEOUT, rx.changed()).await {
        Ok(Ok(())) => info!("{:?} processed", event),
        Ok(Err(_)) => warn!("Compensator went away before processing {:?}", event),
        Err(_) => warn!("Timed out waiting for {:?} to be processed", event),
    }
}
