//! Shared components for the flexure workspace.
//!
//! Holds the sky-coordinate math and the wall-clock abstraction used by both
//! the compensation core and the simulation harness.

pub mod clock;
pub mod coordinates;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinates::{Equatorial, Separation};
