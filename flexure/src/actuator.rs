//! Pushes the shift rate to the guider
//!
//! Every call runs on its own token that nobody cancels, so a zero rate still
//! reaches the guider while the surrounding sequence is being cancelled.

use crate::equipment::{DeviceResult, Guider, SiderealShiftRate};
use crate::state::ShiftRate;
use log::{debug, error};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Convert arcseconds per hour to the guider's arcseconds per second
pub fn to_guider_rate(rate: ShiftRate) -> SiderealShiftRate {
    SiderealShiftRate {
        ra_arcsec_per_sec: rate.ra / 3600.0,
        dec_arcsec_per_sec: rate.dec / 3600.0,
    }
}

#[derive(Clone)]
pub struct ShiftRateActuator {
    guider: Arc<dyn Guider>,
}

impl ShiftRateActuator {
    pub fn new(guider: Arc<dyn Guider>) -> Self {
        Self { guider }
    }

    /// Push `rate` to the guider
    pub async fn set_shift_rate(&self, rate: ShiftRate) -> DeviceResult<()> {
        let token = CancellationToken::new();
        debug!("Setting shift rate {:.3} | {:.3} arcsec/hr", rate.ra, rate.dec);
        self.guider.set_shift_rate(to_guider_rate(rate), &token).await
    }

    /// Stop the lock position from moving
    pub async fn stop_shifting(&self) -> DeviceResult<()> {
        let token = CancellationToken::new();
        self.guider.stop_shifting(&token).await
    }

    /// Push `rate`, logging rather than returning a failure
    pub async fn apply(&self, rate: ShiftRate) {
        if let Err(e) = self.set_shift_rate(rate).await {
            error!("Failed to set shift rate on guider: {}", e);
        }
    }

    /// Push a zero rate and stop shifting, logging failures
    pub async fn zero_and_stop(&self) {
        self.apply(ShiftRate::ZERO).await;
        if let Err(e) = self.stop_shifting().await {
            error!("Failed to stop shifting on guider: {}", e);
        }
    }
}

impl std::fmt::Debug for ShiftRateActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShiftRateActuator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_equipment::MockGuider;
    use approx::assert_relative_eq;

    #[test]
    fn test_rate_conversion() {
        let rate = to_guider_rate(ShiftRate::new(36.0, -7.2));
        assert_relative_eq!(rate.ra_arcsec_per_sec, 0.01);
        assert_relative_eq!(rate.dec_arcsec_per_sec, -0.002);
    }

    #[tokio::test]
    async fn test_zero_and_stop() {
        let guider = Arc::new(MockGuider::new(1.0));
        let actuator = ShiftRateActuator::new(guider.clone());

        actuator.apply(ShiftRate::new(3.6, 0.0)).await;
        actuator.zero_and_stop().await;

        let rates = guider.applied_rates();
        assert_eq!(rates.len(), 2);
        assert_relative_eq!(rates[0].ra_arcsec_per_sec, 0.001);
        assert_eq!(rates[1], SiderealShiftRate::default());
        assert_eq!(guider.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_guider_failure_is_absorbed() {
        let guider = Arc::new(MockGuider::new(1.0));
        guider.fail_rate_commands(true);
        let actuator = ShiftRateActuator::new(guider.clone());

        assert!(actuator.set_shift_rate(ShiftRate::new(1.0, 1.0)).await.is_err());
        actuator.zero_and_stop().await;
        assert!(guider.applied_rates().is_empty());
    }
}
