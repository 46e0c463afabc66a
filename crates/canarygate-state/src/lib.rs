//! canarygate-state — embedded state store for canarygate.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for alarms, rollouts, incidents, metric points, and
//! probe run summaries.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{series}|{timestamp:020}`, `{probe}|{started_at:020}`)
//! are zero-padded so that lexicographic order equals chronological order,
//! enabling efficient range scans over series and run history.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Writer discipline is by convention:
//! the prober writes probe runs and metric points, the evaluator writes
//! alarms, the gate writes rollouts, the notifier writes incidents.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
