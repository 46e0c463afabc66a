//! MetricStream — append-only series over the state store.
//!
//! `record` appends, `query` reads a window, `period_values` reduces the
//! last n evaluation periods for the alarm evaluator. Writer discipline
//! is by convention: one writer per series (the prober), any number of
//! readers.

use tracing::debug;

use canarygate_state::{MetricPoint, ProbeRunRecord, SeriesKey, StateStore, Statistic};

use crate::error::MetricError;

/// Namespace probe-fed series live under.
const NAMESPACE: &str = "canarygate";

/// The success series for a probe: 1.0 = passing run, 0.0 = failing run.
pub fn success_series(probe: &str) -> SeriesKey {
    SeriesKey::new(NAMESPACE, "success").with_dimension("probe", probe)
}

/// The wall-time series for a probe, in milliseconds.
pub fn duration_series(probe: &str) -> SeriesKey {
    SeriesKey::new(NAMESPACE, "duration_ms").with_dimension("probe", probe)
}

/// Append-only metric series facade over the state store.
#[derive(Clone)]
pub struct MetricStream {
    store: StateStore,
}

impl MetricStream {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Append one point to a series.
    pub fn record(
        &self,
        series: &SeriesKey,
        timestamp: u64,
        value: f64,
    ) -> Result<(), MetricError> {
        let point = MetricPoint {
            series: series.clone(),
            timestamp,
            value,
        };
        self.store
            .record_metric_point(&point)
            .map_err(MetricError::Record)?;
        debug!(series = %series.storage_key(), timestamp, value, "metric point recorded");
        Ok(())
    }

    /// Reduce a probe run to its metric points.
    ///
    /// This is where pass/fail semantics are decided for downstream
    /// alarms: a passing run is 1.0 on the success series, a failing run
    /// 0.0, and the run's wall time lands on the duration series. Points
    /// carry the run's completion time, since that is when the verdict
    /// exists.
    pub fn record_run(&self, run: &ProbeRunRecord) -> Result<(), MetricError> {
        let value = if run.passed { 1.0 } else { 0.0 };
        self.record(&success_series(&run.probe), run.finished_at, value)?;

        let duration_ms: u64 = run.steps.iter().map(|s| s.latency_ms).sum();
        self.record(
            &duration_series(&run.probe),
            run.finished_at,
            duration_ms as f64,
        )?;
        Ok(())
    }

    /// All points of a series with timestamps in `[from, to]`, oldest first.
    pub fn query(
        &self,
        series: &SeriesKey,
        from: u64,
        to: u64,
    ) -> Result<Vec<MetricPoint>, MetricError> {
        Ok(self.store.list_metric_points(series, from, to)?)
    }

    /// Reduce one window of a series, `None` when the window is empty.
    pub fn aggregate(
        &self,
        series: &SeriesKey,
        from: u64,
        to: u64,
        statistic: Statistic,
    ) -> Result<Option<f64>, MetricError> {
        let points = self.query(series, from, to)?;
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        Ok(reduce(&values, statistic))
    }

    /// The last `periods` period aggregates of a series, oldest first.
    ///
    /// Period windows are half-open and tile backwards from `now`: the
    /// newest period covers `[now - period_secs, now)`. A period with no
    /// points yields `None`.
    pub fn period_values(
        &self,
        series: &SeriesKey,
        period_secs: u64,
        periods: u32,
        now: u64,
        statistic: Statistic,
    ) -> Result<Vec<Option<f64>>, MetricError> {
        let mut values = Vec::with_capacity(periods as usize);
        for k in (0..periods as u64).rev() {
            let end = now.saturating_sub(k * period_secs);
            if end == 0 {
                // Window lies entirely before time zero.
                values.push(None);
                continue;
            }
            let start = end.saturating_sub(period_secs);
            values.push(self.aggregate(series, start, end - 1, statistic)?);
        }
        Ok(values)
    }
}

/// Reduce a window of values, `None` when the window is empty.
///
/// An empty window means the period had no data; callers must not
/// conflate that with 0.
fn reduce(values: &[f64], statistic: Statistic) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let reduced = match statistic {
        Statistic::Sum => values.iter().sum::<f64>(),
        Statistic::Average => values.iter().sum::<f64>() / values.len() as f64,
        Statistic::Count => values.len() as f64,
        Statistic::Minimum => values.iter().copied().fold(f64::INFINITY, f64::min),
        Statistic::Maximum => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Some(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canarygate_state::{StepOutcome, StepRecord};

    fn test_stream() -> MetricStream {
        MetricStream::new(StateStore::open_in_memory().unwrap())
    }

    fn test_run(probe: &str, started_at: u64, passed: bool) -> ProbeRunRecord {
        ProbeRunRecord {
            probe: probe.to_string(),
            started_at,
            finished_at: started_at + 1,
            steps: vec![
                StepRecord {
                    name: "allowed".to_string(),
                    outcome: StepOutcome::Passed,
                    latency_ms: 30,
                    continue_on_failure: false,
                },
                StepRecord {
                    name: "blocked".to_string(),
                    outcome: StepOutcome::Passed,
                    latency_ms: 12,
                    continue_on_failure: false,
                },
            ],
            passed,
        }
    }

    #[test]
    fn record_and_query_window() {
        let stream = test_stream();
        let series = success_series("waf-canary");

        for ts in [100u64, 160, 220] {
            stream.record(&series, ts, 1.0).unwrap();
        }

        let points = stream.query(&series, 100, 160).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, 100);
        assert_eq!(points[1].timestamp, 160);
    }

    #[test]
    fn record_run_maps_verdict_to_success_series() {
        let stream = test_stream();

        stream.record_run(&test_run("waf-canary", 100, true)).unwrap();
        stream.record_run(&test_run("waf-canary", 160, false)).unwrap();

        let points = stream
            .query(&success_series("waf-canary"), 0, 200)
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 1.0);
        assert_eq!(points[1].value, 0.0);
        // Points land at completion time, not start time.
        assert_eq!(points[0].timestamp, 101);
    }

    #[test]
    fn record_run_records_wall_time() {
        let stream = test_stream();
        stream.record_run(&test_run("waf-canary", 100, true)).unwrap();

        let points = stream
            .query(&duration_series("waf-canary"), 0, 200)
            .unwrap();
        assert_eq!(points.len(), 1);
        // Sum of the per-step latencies.
        assert_eq!(points[0].value, 42.0);
    }

    #[test]
    fn aggregate_statistics() {
        let stream = test_stream();
        let series = success_series("waf-canary");
        for (ts, value) in [(100u64, 1.0), (110, 0.0), (120, 1.0), (130, 1.0)] {
            stream.record(&series, ts, value).unwrap();
        }

        let agg = |stat| stream.aggregate(&series, 100, 130, stat).unwrap().unwrap();
        assert_eq!(agg(Statistic::Sum), 3.0);
        assert_eq!(agg(Statistic::Average), 0.75);
        assert_eq!(agg(Statistic::Count), 4.0);
        assert_eq!(agg(Statistic::Minimum), 0.0);
        assert_eq!(agg(Statistic::Maximum), 1.0);
    }

    #[test]
    fn empty_window_aggregates_to_none() {
        let stream = test_stream();
        let series = success_series("waf-canary");
        stream.record(&series, 500, 0.0).unwrap();

        // The window before the point has no data — absence, not zero,
        // and not a zero count either.
        for stat in [Statistic::Sum, Statistic::Count, Statistic::Average] {
            assert_eq!(stream.aggregate(&series, 0, 499, stat).unwrap(), None);
        }
    }

    #[test]
    fn period_values_marks_gaps_none() {
        let stream = test_stream();
        let series = success_series("waf-canary");

        // Three 100s periods ending at now=300: [0,100) [100,200) [200,300).
        // Data only in the oldest and newest.
        stream.record(&series, 50, 1.0).unwrap();
        stream.record(&series, 250, 0.0).unwrap();

        let values = stream
            .period_values(&series, 100, 3, 300, Statistic::Sum)
            .unwrap();
        assert_eq!(values, vec![Some(1.0), None, Some(0.0)]);
    }

    #[test]
    fn period_values_are_oldest_first() {
        let stream = test_stream();
        let series = success_series("waf-canary");
        stream.record(&series, 50, 1.0).unwrap();
        stream.record(&series, 150, 2.0).unwrap();
        stream.record(&series, 250, 3.0).unwrap();

        let values = stream
            .period_values(&series, 100, 3, 300, Statistic::Sum)
            .unwrap();
        assert_eq!(values, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn period_boundaries_are_half_open() {
        let stream = test_stream();
        let series = success_series("waf-canary");

        // ts=100 is the start of the middle period, not the end of the
        // oldest one; ts=99 belongs to the oldest.
        stream.record(&series, 99, 1.0).unwrap();
        stream.record(&series, 100, 2.0).unwrap();

        let values = stream
            .period_values(&series, 100, 3, 300, Statistic::Sum)
            .unwrap();
        assert_eq!(values, vec![Some(1.0), Some(2.0), None]);
    }

    #[test]
    fn series_are_isolated() {
        let stream = test_stream();
        stream.record(&success_series("a"), 100, 1.0).unwrap();
        stream.record(&success_series("b"), 100, 0.0).unwrap();

        let a = stream.query(&success_series("a"), 0, 200).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].value, 1.0);
    }
}
