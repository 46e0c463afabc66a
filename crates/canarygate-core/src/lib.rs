//! canarygate-core — configuration and scheduling primitives.
//!
//! Parses `canarygate.toml` into explicit config structs that are handed
//! to each subsystem at construction time (no ambient/global config), and
//! provides the `Schedule` abstraction that drives the periodic probe and
//! evaluation loops.

pub mod config;
pub mod schedule;

pub use config::GateConfig;
pub use schedule::{Schedule, parse_duration};
