use clap::Parser;
use flexure::events::EventBus;
use flexure::{CompensatorConfig, FlexureCompensator};
use flexure_harness::{run_sequence, FlexureModel, RigConfig, SequenceStep, SimulatedRig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Command line arguments for the drift demo
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Flexure compensation convergence on a simulated rig"
)]
struct Args {
    /// Steady RA flexure in arcsec/hr
    #[arg(long, default_value_t = 12.0)]
    flexure_ra: f64,

    /// Steady Dec flexure in arcsec/hr
    #[arg(long, default_value_t = 0.0)]
    flexure_dec: f64,

    /// Oscillation amplitude on both axes in arcsec
    #[arg(long, default_value_t = 0.0)]
    wobble: f64,

    /// Oscillation period in hours
    #[arg(long, default_value_t = 2.0)]
    wobble_period: f64,

    /// Fraction of the measured drift fed back per correction
    #[arg(short, long)]
    aggressivity: Option<f64>,

    /// Noise threshold in imaging pixels per exposure
    #[arg(long)]
    min_drift_px: Option<f64>,

    /// Discontinuity threshold in imaging pixels per exposure
    #[arg(long)]
    max_drift_px: Option<f64>,

    /// Measure after every Nth light frame
    #[arg(long)]
    after_exposures: Option<u32>,

    /// Light exposure length in seconds
    #[arg(short, long, default_value_t = 300.0)]
    exposure: f64,

    /// Number of light frames
    #[arg(short = 'n', long, default_value_t = 24)]
    frames: usize,

    /// Meridian flip after this many frames
    #[arg(long)]
    flip_after: Option<usize>,

    /// Plate solve noise in arcsec
    #[arg(long, default_value_t = 0.05)]
    noise: f64,

    /// Random seed for solve noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Compensator configuration JSON; command line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn compensator_config(&self) -> anyhow::Result<CompensatorConfig> {
        let mut config = match &self.config {
            Some(path) => CompensatorConfig::load_from_file(path)?,
            None => CompensatorConfig::default(),
        };
        if let Some(aggressivity) = self.aggressivity {
            config.aggressivity = aggressivity;
        }
        if let Some(min) = self.min_drift_px {
            config.min_drift_limit_px = min;
        }
        if let Some(max) = self.max_drift_px {
            config.max_drift_limit_px = max;
        }
        if let Some(after) = self.after_exposures {
            config.after_exposures = after;
        }
        config.validate()?;
        Ok(config)
    }

    fn steps(&self) -> Vec<SequenceStep> {
        let mut steps = Vec::with_capacity(self.frames + 1);
        for i in 0..self.frames {
            if self.flip_after == Some(i) {
                steps.push(SequenceStep::MeridianFlip);
            }
            steps.push(SequenceStep::light(self.exposure));
        }
        steps
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.compensator_config()?;

    let flexure = FlexureModel::linear(args.flexure_ra, args.flexure_dec).with_oscillation(
        args.wobble,
        args.wobble,
        args.wobble_period,
    );
    let rig = SimulatedRig::new(RigConfig {
        flexure,
        solve_noise_arcsec: args.noise,
        seed: args.seed,
        ..Default::default()
    });
    let compensator = FlexureCompensator::new(rig.equipment(), EventBus::new(), config.clone())?;

    println!("Flexure: {}", flexure.description());
    println!(
        "Aggressivity {:.2}, limits {:.2}..{:.2} px, every {} exposure(s)",
        config.aggressivity,
        config.min_drift_limit_px,
        config.max_drift_limit_px,
        config.after_exposures
    );
    println!();

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let report = match run_sequence(&compensator, &rig, &args.steps(), &token).await {
        Ok(report) => report,
        Err(e) if e.is_cancelled() => {
            println!("Interrupted");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{:>5} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "frame", "hours", "shift RA", "shift Dec", "resid RA", "resid Dec", "smear\""
    );
    for record in &report.records {
        println!(
            "{:>5} {:>8.3} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>8.3}",
            record.index,
            record.elapsed_hours,
            record.shift_rate.ra,
            record.shift_rate.dec,
            record.residual_rate.0,
            record.residual_rate.1,
            record.smear_arcsec
        );
    }

    if let Some(last) = report.last() {
        println!();
        println!(
            "Final residual {:.2} | {:.2} arcsec/hr, smear {:.3} arcsec per frame",
            last.residual_rate.0, last.residual_rate.1, last.smear_arcsec
        );
    }

    Ok(())
}
