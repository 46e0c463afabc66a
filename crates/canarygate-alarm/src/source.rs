//! Metric fetch seam for alarm evaluation.
//!
//! `MetricStream` is the production source of period aggregates; tests
//! substitute sources that fail reads to exercise the evaluator's
//! hold-state path.

use canarygate_metrics::{MetricError, MetricStream};
use canarygate_state::{SeriesKey, Statistic};

/// Source of period aggregates the evaluator reads each tick.
pub trait MetricSource: Send + Sync {
    /// The last `periods` period aggregates of a series ending at `now`,
    /// oldest first, `None` for periods with no data.
    fn period_values(
        &self,
        series: &SeriesKey,
        period_secs: u64,
        periods: u32,
        now: u64,
        statistic: Statistic,
    ) -> Result<Vec<Option<f64>>, MetricError>;
}

impl MetricSource for MetricStream {
    fn period_values(
        &self,
        series: &SeriesKey,
        period_secs: u64,
        periods: u32,
        now: u64,
        statistic: Statistic,
    ) -> Result<Vec<Option<f64>>, MetricError> {
        MetricStream::period_values(self, series, period_secs, periods, now, statistic)
    }
}
