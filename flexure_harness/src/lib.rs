//! Flexure harness for testing and simulation
//!
//! Provides a simulated observatory rig whose guide scope flexes against the
//! imaging scope, and a runner that drives the flexure compensator through a
//! scripted imaging sequence on simulated time.

pub mod flexure_model;
pub mod rig;
pub mod runner;

pub use flexure_model::FlexureModel;
pub use rig::{LogStatusSink, RigConfig, SimulatedRig};
pub use runner::{run_sequence, ExposureRecord, SequenceReport, SequenceStep};
