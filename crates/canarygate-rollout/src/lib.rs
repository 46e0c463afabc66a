//! canarygate-rollout — staged traffic shifting behind alarm gates.
//!
//! The deployment gate advances a rollout through its percent stages on
//! dwell timers, but only while every gating alarm stays out of ALARM.
//! A firing alarm pauses the rollout in place (report-only mode) or
//! reverts traffic to 0% and marks it terminal (auto-rollback). The
//! external deployment system sits behind the `TrafficController` trait;
//! the gate decides, the controller applies.
//!
//! # Components
//!
//! - **`traffic`** — TrafficController trait + in-process stand-in
//! - **`gate`** — DeploymentGate reconcile loop (advance, pause, resume, cancel)

pub mod gate;
pub mod traffic;

pub use gate::{run_gate, DeploymentGate, GateError, SharedGate};
pub use traffic::{InProcessTraffic, TrafficController};
