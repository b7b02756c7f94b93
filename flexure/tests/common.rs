//! Common utilities for flexure tests
#![allow(dead_code)]

use flexure::equipment::{BinningMode, LockPosition};
use flexure::events::EventBus;
use flexure::mock_equipment::{MockRig, SolveOutcome};
use flexure::{CompensatorConfig, ExposureItem, FlexureCompensator, FlexureResult};
use shared::{Clock, Equatorial};
use tokio_util::sync::CancellationToken;

/// Light exposure length used by most tests, one hour
pub const LIGHT_SECS: f64 = 3600.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Field centre on the celestial equator so RA arcseconds equal on-sky arcseconds
pub fn field_centre() -> Equatorial {
    Equatorial::from_degrees(150.0, 0.0)
}

pub fn light() -> ExposureItem {
    ExposureItem::light(LIGHT_SECS, BinningMode::new(1, 1))
}

/// Mock equipment, bus and compensator wired together
pub struct TestSetup {
    pub rig: MockRig,
    pub bus: EventBus,
    pub compensator: FlexureCompensator,
    pub token: CancellationToken,
}

impl TestSetup {
    pub fn new(config: CompensatorConfig) -> Self {
        init_logging();
        let rig = MockRig::new();
        rig.mount.set_coordinates(field_centre());
        let bus = EventBus::new();
        let compensator = FlexureCompensator::new(rig.equipment(), bus.clone(), config)
            .expect("valid configuration");
        let setup = Self {
            rig,
            bus,
            compensator,
            token: CancellationToken::new(),
        };
        setup.hold_lock_position(100.0, 100.0);
        setup
    }

    /// Pin the guider lock position at the current time
    pub fn hold_lock_position(&self, x: f64, y: f64) {
        self.rig.guider.set_lock_position(Some(LockPosition {
            x,
            y,
            event_time: self.rig.clock.now(),
        }));
    }

    /// Queue a successful solve offset from the field centre by arcseconds of RA and Dec
    pub fn solve_at(&self, d_ra_arcsec: f64, d_dec_arcsec: f64) {
        self.rig.solver.push(SolveOutcome::Solved(
            field_centre().offset_arcsec(d_ra_arcsec, d_dec_arcsec),
            1.0,
        ));
    }

    /// Boundary ahead of the first light frame
    pub async fn start_sequence(&self) -> FlexureResult<()> {
        self.compensator.should_trigger(&light()).await;
        self.compensator.execute(&self.token).await
    }

    /// Let a light frame run, then process the boundary before the next one
    pub async fn next_light(&self) -> FlexureResult<()> {
        self.rig.clock.advance_secs(LIGHT_SECS);
        self.compensator.should_trigger_after(&light()).await;
        self.compensator.should_trigger(&light()).await;
        self.compensator.execute(&self.token).await
    }
}
