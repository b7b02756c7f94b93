//! Plate solving of reference exposures
//!
//! Wraps the external solver: a hinted solve around the mount position first,
//! then a blind solve if that fails and blind failover is enabled. Retries
//! beyond that are left to the next measurement cycle.

use crate::acquire::report_status;
use crate::config::PlateSolveSettings;
use crate::equipment::{
    BinningMode, DeviceError, PlateSolveParameter, PlateSolveResult, PlateSolver, SolvableImage,
    StatusSink,
};
use crate::error::{FlexureError, FlexureResult};
use log::{debug, warn};
use shared::Equatorial;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A successful solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolvedField {
    pub coordinates: Equatorial,
    /// Image scale in arcsec per pixel
    pub pixel_scale: f64,
}

impl SolvedField {
    /// A solution without a usable image scale cannot size the drift limits
    fn from_result(result: &PlateSolveResult) -> Option<Self> {
        let scale_usable = result.pixel_scale.is_finite() && result.pixel_scale > 0.0;
        (result.success && result.coordinates.is_finite() && scale_usable).then_some(Self {
            coordinates: result.coordinates,
            pixel_scale: result.pixel_scale,
        })
    }
}

/// Build solver parameters for a reference exposure
pub fn solve_parameter(
    settings: &PlateSolveSettings,
    binning: BinningMode,
    hint: Option<Equatorial>,
) -> PlateSolveParameter {
    PlateSolveParameter {
        binning: binning.x,
        coordinates: hint.filter(|c| c.is_finite()),
        focal_length_mm: settings.focal_length_mm,
        pixel_size_um: settings.pixel_size_um,
        search_radius_deg: settings.search_radius_deg,
        max_objects: settings.max_objects,
        regions: settings.regions,
        blind_failover_enabled: settings.blind_failover_enabled,
    }
}

#[derive(Clone)]
pub struct FieldSolverAdapter {
    solver: Arc<dyn PlateSolver>,
    status: Arc<dyn StatusSink>,
}

impl FieldSolverAdapter {
    pub fn new(solver: Arc<dyn PlateSolver>, status: Arc<dyn StatusSink>) -> Self {
        Self { solver, status }
    }

    /// Solve `image`, returning `Ok(None)` if no solution was found.
    ///
    /// Only cancellation is returned as an error. Solver failures count as a
    /// failed attempt.
    pub async fn solve(
        &self,
        image: &SolvableImage,
        parameter: &PlateSolveParameter,
        token: &CancellationToken,
    ) -> FlexureResult<Option<SolvedField>> {
        report_status(self.status.as_ref(), "Solving");
        let result = self.solve_with_failover(image, parameter, token).await;
        report_status(self.status.as_ref(), "");
        result
    }

    async fn solve_with_failover(
        &self,
        image: &SolvableImage,
        parameter: &PlateSolveParameter,
        token: &CancellationToken,
    ) -> FlexureResult<Option<SolvedField>> {
        if parameter.coordinates.is_some() {
            let hinted = tokio::select! {
                biased;
                _ = token.cancelled() => Err(DeviceError::Cancelled),
                result = self.solver.solve(image, parameter, token) => result,
            };
            if let Some(field) = Self::accept(hinted, "hinted")? {
                return Ok(Some(field));
            }
            if !parameter.blind_failover_enabled {
                return Ok(None);
            }
            debug!("Hinted solve failed, trying a blind solve");
        }

        let blind = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = self.solver.blind_solve(image, parameter, token) => result,
        };
        Self::accept(blind, "blind")
    }

    fn accept(
        result: Result<PlateSolveResult, DeviceError>,
        kind: &str,
    ) -> FlexureResult<Option<SolvedField>> {
        match result {
            Ok(result) => {
                let field = SolvedField::from_result(&result);
                match &field {
                    Some(f) => debug!(
                        "{} solve succeeded: {} at {:.3} arcsec/px",
                        kind, f.coordinates, f.pixel_scale
                    ),
                    None if result.success => warn!(
                        "{} solve returned an unusable solution at {:.3} arcsec/px",
                        kind, result.pixel_scale
                    ),
                    None => debug!("{} solve found no solution", kind),
                }
                Ok(field)
            }
            Err(DeviceError::Cancelled) => Err(FlexureError::Cancelled),
            Err(e) => {
                warn!("{} solve failed: {}", kind, e);
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for FieldSolverAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FieldSolverAdapter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipment::{ExposureMetadata, NullStatusSink};
    use crate::mock_equipment::{MockSolver, SolveOutcome};
    use chrono::{DateTime, Utc};
    use ndarray::Array2;

    fn image() -> SolvableImage {
        SolvableImage {
            pixels: Array2::zeros((8, 8)),
            exposure_start: DateTime::<Utc>::UNIX_EPOCH,
            metadata: ExposureMetadata::default(),
        }
    }

    fn adapter(solver: Arc<MockSolver>) -> FieldSolverAdapter {
        FieldSolverAdapter::new(solver, Arc::new(NullStatusSink))
    }

    fn hinted() -> PlateSolveParameter {
        solve_parameter(
            &PlateSolveSettings::default(),
            BinningMode::new(2, 2),
            Some(Equatorial::from_degrees(10.0, 10.0)),
        )
    }

    #[test]
    fn test_parameter_from_settings() {
        let settings = PlateSolveSettings::default();
        let param = solve_parameter(&settings, BinningMode::new(3, 3), Some(Equatorial::new(f64::NAN, 0.0)));
        assert_eq!(param.binning, 3);
        assert_eq!(param.coordinates, None);
        assert_eq!(param.search_radius_deg, settings.search_radius_deg);
        assert!(param.blind_failover_enabled);
    }

    #[tokio::test]
    async fn test_hinted_solve() {
        let solver = Arc::new(MockSolver::new());
        let target = Equatorial::from_degrees(10.0, 10.0);
        solver.push(SolveOutcome::Solved(target, 1.1));

        let field = adapter(solver.clone())
            .solve(&image(), &hinted(), &CancellationToken::new())
            .await
            .unwrap()
            .expect("solution");
        assert_eq!(field.coordinates, target);
        assert_eq!(solver.blind_calls(), 0);
    }

    #[tokio::test]
    async fn test_blind_failover() {
        let solver = Arc::new(MockSolver::new());
        let target = Equatorial::from_degrees(11.0, 9.0);
        solver.push(SolveOutcome::NoSolution);
        solver.push(SolveOutcome::Solved(target, 1.1));

        let field = adapter(solver.clone())
            .solve(&image(), &hinted(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(field.map(|f| f.coordinates), Some(target));
        assert_eq!(solver.blind_calls(), 1);
    }

    #[tokio::test]
    async fn test_solution_without_usable_scale_fails_over() {
        let solver = Arc::new(MockSolver::new());
        let target = Equatorial::from_degrees(11.0, 9.0);
        solver.push(SolveOutcome::Solved(target, f64::NAN));
        solver.push(SolveOutcome::Solved(target, 1.1));

        let field = adapter(solver.clone())
            .solve(&image(), &hinted(), &CancellationToken::new())
            .await
            .unwrap()
            .expect("blind solution");
        assert_eq!(field.pixel_scale, 1.1);
        assert_eq!(solver.blind_calls(), 1);

        solver.push(SolveOutcome::Solved(target, 0.0));
        solver.push(SolveOutcome::Solved(target, -1.1));
        let field = adapter(solver.clone())
            .solve(&image(), &hinted(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(field, None);
    }

    #[tokio::test]
    async fn test_failover_disabled() {
        let solver = Arc::new(MockSolver::new());
        solver.push(SolveOutcome::NoSolution);
        let param = PlateSolveParameter {
            blind_failover_enabled: false,
            ..hinted()
        };

        let field = adapter(solver.clone())
            .solve(&image(), &param, &CancellationToken::new())
            .await
            .unwrap();
        assert!(field.is_none());
        assert_eq!(solver.blind_calls(), 0);
    }

    #[tokio::test]
    async fn test_solver_error_is_a_failed_attempt() {
        let solver = Arc::new(MockSolver::new());
        solver.push(SolveOutcome::Error(DeviceError::Other("astap crashed".into())));
        solver.push(SolveOutcome::NoSolution);

        let field = adapter(solver)
            .solve(&image(), &hinted(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(field.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_solve() {
        let solver = Arc::new(MockSolver::new());
        solver.push(SolveOutcome::Solved(Equatorial::from_degrees(1.0, 1.0), 1.0));
        let token = CancellationToken::new();
        token.cancel();

        let result = adapter(solver).solve(&image(), &hinted(), &token).await;
        assert!(matches!(result, Err(FlexureError::Cancelled)));
    }
}
