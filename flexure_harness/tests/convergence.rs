use approx::assert_relative_eq;
use flexure::equipment::FilterInfo;
use flexure::events::EventBus;
use flexure::{CompensatorConfig, FlexureCompensator, FlexureError};
use flexure_harness::{run_sequence, FlexureModel, RigConfig, SequenceStep, SimulatedRig};
use tokio_util::sync::CancellationToken;

const EXPOSURE_SECS: f64 = 300.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(rig_config: RigConfig, config: CompensatorConfig) -> (SimulatedRig, FlexureCompensator) {
    init_logging();
    let rig = SimulatedRig::new(rig_config);
    let compensator = FlexureCompensator::new(rig.equipment(), EventBus::new(), config)
        .expect("valid configuration");
    (rig, compensator)
}

fn noiseless() -> RigConfig {
    RigConfig {
        solve_noise_arcsec: 0.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_converges_on_linear_flexure() {
    let (rig, compensator) = setup(RigConfig::default(), CompensatorConfig::default());
    let steps = SequenceStep::lights(10, EXPOSURE_SECS);

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.records.len(), 10);
    let rate = report.final_snapshot.shift_rate;
    assert!(rate.ra < 0.0, "shift rate should oppose the drift: {:?}", rate);
    assert!((rate.ra + 12.0).abs() < 4.0, "did not converge: {:?}", rate);

    let first = &report.records[0];
    let last = report.last().unwrap();
    assert!(last.residual_rate.0.abs() < first.residual_rate.0.abs());
    assert!(last.smear_arcsec < first.smear_arcsec);
}

#[tokio::test]
async fn test_no_flexure_leaves_rate_at_zero() {
    let (rig, compensator) = setup(
        RigConfig {
            flexure: FlexureModel::linear(0.0, 0.0),
            ..Default::default()
        },
        CompensatorConfig::default(),
    );

    let report = run_sequence(
        &compensator,
        &rig,
        &SequenceStep::lights(6, EXPOSURE_SECS),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.final_snapshot.shift_rate.is_zero());
    assert_eq!(rig.applied_shift_rate(), (0.0, 0.0));
}

#[tokio::test]
async fn test_meridian_flip_restarts_estimate() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let mut steps = SequenceStep::lights(6, EXPOSURE_SECS);
    steps.push(SequenceStep::MeridianFlip);
    steps.extend(SequenceStep::lights(6, EXPOSURE_SECS));

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.records[5].shift_rate.ra < 0.0);
    // The first frame after the flip starts from zero
    assert!(report.records[6].shift_rate.is_zero());
    assert!(report.final_snapshot.shift_rate.ra > 0.0);
}

#[tokio::test]
async fn test_dither_does_not_bend_the_rate() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let mut steps = SequenceStep::lights(6, EXPOSURE_SECS);
    // Half a guide pixel is well inside the drift limits if it went unnoticed
    steps.push(SequenceStep::Dither {
        dx_px: 0.0,
        dy_px: 0.5,
    });
    steps.extend(SequenceStep::lights(4, EXPOSURE_SECS));

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.final_snapshot.shift_rate.dec, 0.0);
    assert!(report.final_snapshot.shift_rate.ra < 0.0);
}

#[tokio::test]
async fn test_filter_change_takes_new_baseline() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let mut steps = SequenceStep::lights(6, EXPOSURE_SECS);
    steps.push(SequenceStep::ChangeFilter(FilterInfo::new("R", 1)));
    steps.extend(SequenceStep::lights(4, EXPOSURE_SECS));

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &report.final_snapshot;
    assert_eq!(snapshot.shift_rate.dec, 0.0);
    assert!(snapshot.shift_rate.ra < 0.0);
    // Teardown clears the sample but keeps the rate
    assert!(snapshot.last_sample.is_none());
}

#[tokio::test]
async fn test_refocus_keeps_rate() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let mut steps = SequenceStep::lights(6, EXPOSURE_SECS);
    let first_after_refocus = 6;
    steps.push(SequenceStep::Refocus(10_050));
    steps.extend(SequenceStep::lights(2, EXPOSURE_SECS));

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.records[first_after_refocus].shift_rate.ra < 0.0);
    assert!(report.final_snapshot.shift_rate.ra < 0.0);
}

#[tokio::test]
async fn test_darks_do_not_trigger() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let steps = vec![
        SequenceStep::Dark { exposure_secs: 600.0 },
        SequenceStep::Dark { exposure_secs: 600.0 },
    ];

    let report = run_sequence(&compensator, &rig, &steps, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.records.is_empty());
    assert!(report.final_snapshot.last_sample.is_none());
    assert_eq!(report.final_snapshot.exposure_count, 0);
    assert_relative_eq!(rig.elapsed_hours(), 1.0 / 3.0, epsilon = 1e-9);
}

#[tokio::test]
async fn test_solve_failures_delay_correction() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    // Hinted and blind attempts of the first baseline both fail
    rig.fail_next_solves(2);

    let report = run_sequence(
        &compensator,
        &rig,
        &SequenceStep::lights(2, EXPOSURE_SECS),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // The first frame's after-check only lays the baseline the second one measures against
    assert!(report.records.iter().all(|r| r.shift_rate.is_zero()));
    assert!(report.final_snapshot.shift_rate.ra < 0.0);
}

#[tokio::test]
async fn test_skip_factor_slows_corrections() {
    let (rig, compensator) = setup(
        noiseless(),
        CompensatorConfig {
            after_exposures: 3,
            ..Default::default()
        },
    );

    let report = run_sequence(
        &compensator,
        &rig,
        &SequenceStep::lights(3, EXPOSURE_SECS),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Only the after-check of the third frame measures, over three frames of drift
    assert!(report.records.iter().all(|r| r.shift_rate.is_zero()));
    assert!(report.final_snapshot.shift_rate.ra < 0.0);
    assert_eq!(report.final_snapshot.progress_exposures, 0);
}

#[tokio::test]
async fn test_disconnected_camera_aborts_sequence() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    rig.set_camera_connected(false);

    let result = run_sequence(
        &compensator,
        &rig,
        &SequenceStep::lights(2, EXPOSURE_SECS),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(FlexureError::CameraNotConnected)));
    assert!(!compensator.snapshot().running);
}

#[tokio::test]
async fn test_cancelled_sequence_reports_cancellation() {
    let (rig, compensator) = setup(noiseless(), CompensatorConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let result = run_sequence(
        &compensator,
        &rig,
        &SequenceStep::lights(2, EXPOSURE_SECS),
        &token,
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert!(!compensator.snapshot().running);
    assert!(compensator.snapshot().last_sample.is_none());
}
