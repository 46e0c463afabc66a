//! canarygate-metrics — the metric stream for canarygate.
//!
//! Probe verdicts become timestamped points in named series; alarms query
//! period aggregates over those series. A period with no points aggregates
//! to `None`, never zero, so missing-data policy can tell "no data" from
//! "value 0".

pub mod error;
pub mod prometheus;
pub mod stream;

pub use error::MetricError;
pub use prometheus::render_prometheus;
pub use stream::{MetricStream, duration_series, success_series};
