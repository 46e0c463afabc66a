//! canarygate-probe — synthetic prober for canarygate.
//!
//! Executes ordered HTTP check scripts against a live target as a real
//! client would, classifying each step as passed, validation-failed, or
//! transport-failed. Failures are data, not errors: both kinds reduce to
//! a failing step record, and the run summary feeds the metric stream.

pub mod prober;
pub mod runner;

pub use prober::Prober;
pub use runner::{run_once, verdict};
