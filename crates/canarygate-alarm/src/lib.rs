//! canarygate-alarm — threshold state machine over metric periods.
//!
//! Evaluates each alarm's series against its threshold once per tick and
//! drives the OK / ALARM / INSUFFICIENT_DATA state machine. Transitions
//! persist to the state store and fan out through a callback to the
//! deployment gate and the incident notifier.
//!
//! # Evaluation
//!
//! ```text
//! window = last evaluation_periods period aggregates (oldest first)
//! gaps   = periods with no data, substituted per missing_data policy:
//!            not_breaching → clearing    breaching → breaching
//!            ignore        → dropped     missing   → INSUFFICIENT_DATA
//!
//! if every period in the window breaches:  → ALARM
//! if the newest period clears:             → OK
//! otherwise:                               hold current state
//! ```
//!
//! Entering ALARM requires the full window of consecutive breaches; a
//! single clearing period recovers. A metric fetch error holds the
//! previous state and retries next tick — the evaluator never falls
//! back to OK on a read failure.

pub mod evaluator;
pub mod source;

pub use evaluator::{AlarmTransition, Evaluator, TransitionCallback};
pub use source::MetricSource;
