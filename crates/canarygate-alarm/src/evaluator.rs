//! Alarm evaluator — drives the OK / ALARM / INSUFFICIENT_DATA machine.
//!
//! Reads period aggregates through the `MetricSource` seam, compares each
//! against the alarm's threshold, and persists any state change.
//! Transitions are handed to a callback so the daemon can fan them out to
//! the deployment gate and the incident notifier.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use canarygate_metrics::MetricError;
use canarygate_state::*;

use crate::source::MetricSource;

/// One state change produced by an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmTransition {
    pub alarm_id: AlarmId,
    pub from: AlarmState,
    pub to: AlarmState,
    /// Unix timestamp (seconds) of the evaluation that caused the change.
    pub at: u64,
    pub reason: String,
}

/// Callback type invoked once per alarm state transition.
///
/// The daemon wires this to the deployment gate and incident notifier.
/// Transitions arrive in evaluation order; the record is already
/// persisted when the callback runs.
pub type TransitionCallback = Arc<dyn Fn(AlarmTransition) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// The evaluator ticks over every configured alarm and updates its state
/// from the latest metric window.
pub struct Evaluator {
    store: StateStore,
    source: Arc<dyn MetricSource>,
    /// Optional callback fired on each transition.
    transition_fn: Option<TransitionCallback>,
}

impl Evaluator {
    /// Create a new evaluator.
    pub fn new(store: StateStore, source: Arc<dyn MetricSource>) -> Self {
        Self {
            store,
            source,
            transition_fn: None,
        }
    }

    /// Set the callback fired on each alarm transition.
    pub fn with_transition_fn(mut self, f: TransitionCallback) -> Self {
        self.transition_fn = Some(f);
        self
    }

    /// Evaluate a single alarm against its metric window.
    ///
    /// Updates the record in place; the caller persists it. Returns the
    /// transition if the state changed.
    pub fn evaluate(
        &self,
        record: &mut AlarmRecord,
        now: u64,
    ) -> Result<Option<AlarmTransition>, MetricError> {
        let spec = &record.spec;
        let values = self.source.period_values(
            &spec.series,
            spec.period_secs,
            spec.evaluation_periods,
            now,
            spec.statistic,
        )?;

        let (next, reason) = decide(spec, &values, record.state);
        record.last_evaluated_at = Some(now);

        if next == record.state {
            return Ok(None);
        }

        let from = record.state;
        record.record_transition(next, now, reason.clone());
        info!(
            alarm = %record.spec.id,
            from = from.as_str(),
            to = next.as_str(),
            %reason,
            "alarm state changed"
        );

        Ok(Some(AlarmTransition {
            alarm_id: record.spec.id.clone(),
            from,
            to: next,
            at: now,
            reason,
        }))
    }

    /// Evaluate every alarm in the store.
    ///
    /// Each transition is persisted before the callback fires, so
    /// subscribers reading the store see the new state. A metric fetch
    /// failure holds that alarm at its previous state and retries next
    /// tick; it never counts as OK.
    pub async fn evaluate_all(&self, now: u64) -> anyhow::Result<Vec<AlarmTransition>> {
        let alarms = self.store.list_alarms()?;
        let mut fired = Vec::new();

        for mut record in alarms {
            let transition = match self.evaluate(&mut record, now) {
                Ok(t) => t,
                Err(e) => {
                    error!(
                        alarm = %record.spec.id,
                        error = %e,
                        "metric fetch failed, holding alarm state"
                    );
                    continue;
                }
            };

            if let Err(e) = self.store.put_alarm(&record) {
                error!(alarm = %record.spec.id, error = %e, "failed to persist alarm");
                continue;
            }

            if let Some(t) = transition {
                if let Some(ref cb) = self.transition_fn {
                    cb(t.clone()).await;
                }
                fired.push(t);
            }
        }

        Ok(fired)
    }

    /// Run the evaluation loop.
    pub async fn run(
        self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "alarm evaluator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all(epoch_secs()).await {
                        error!(error = %e, "alarm evaluation tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("alarm evaluator shutting down");
                    break;
                }
            }
        }
    }
}

/// Decide the target state for one evaluation window.
///
/// `values` holds one aggregate per period, oldest first; `None` marks a
/// period with no recorded data.
fn decide(spec: &AlarmSpec, values: &[Option<f64>], current: AlarmState) -> (AlarmState, String) {
    let gaps = values.iter().filter(|v| v.is_none()).count();

    if spec.missing_data == MissingDataPolicy::Missing && gaps > 0 {
        return (
            AlarmState::InsufficientData,
            format!("{gaps} of {} periods have no data", values.len()),
        );
    }

    // Substitute gaps per policy; `ignore` shrinks the window instead.
    let mut breaching = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Some(v) => breaching.push(spec.comparison.breaches(*v, spec.threshold)),
            None => match spec.missing_data {
                MissingDataPolicy::NotBreaching => breaching.push(false),
                MissingDataPolicy::Breaching => breaching.push(true),
                MissingDataPolicy::Ignore => {}
                MissingDataPolicy::Missing => unreachable!("handled above"),
            },
        }
    }

    if breaching.is_empty() {
        // Every period was a gap and the policy drops gaps: nothing to
        // judge this tick.
        return (current, "no data in window".to_string());
    }

    let breached = breaching.iter().filter(|b| **b).count();

    if breached == breaching.len() {
        return (
            AlarmState::Alarm,
            format!(
                "{breached}/{} periods breaching threshold {}",
                breaching.len(),
                spec.threshold
            ),
        );
    }

    if breaching.last() == Some(&false) {
        return (AlarmState::Ok, "latest period clearing".to_string());
    }

    // Newest period breaches but the streak is shorter than the window.
    (
        current,
        format!("{breached}/{} periods breaching", breaching.len()),
    )
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canarygate_metrics::{MetricStream, success_series};

    fn harness() -> (StateStore, MetricStream, Evaluator) {
        let store = StateStore::open_in_memory().unwrap();
        let stream = MetricStream::new(store.clone());
        let evaluator = Evaluator::new(store.clone(), Arc::new(stream.clone()));
        (store, stream, evaluator)
    }

    /// Alarm on the waf probe's success series: a period whose run sum
    /// falls below 1.0 is breaching. Period 60s, three-period window.
    fn test_spec(id: &str, policy: MissingDataPolicy) -> AlarmSpec {
        AlarmSpec {
            id: id.to_string(),
            series: success_series("waf"),
            statistic: Statistic::Sum,
            period_secs: 60,
            evaluation_periods: 3,
            threshold: 1.0,
            comparison: ComparisonOperator::LessThan,
            missing_data: policy,
        }
    }

    #[test]
    fn trips_exactly_on_nth_breaching_period() {
        let (_, stream, evaluator) = harness();
        let series = success_series("waf");
        let mut record =
            AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::NotBreaching), 0);

        // A passing run settles the alarm at OK.
        stream.record(&series, 30, 1.0).unwrap();
        let t = evaluator.evaluate(&mut record, 60).unwrap().unwrap();
        assert_eq!(t.from, AlarmState::InsufficientData);
        assert_eq!(record.state, AlarmState::Ok);

        // First breaching period: no transition.
        stream.record(&series, 70, 0.0).unwrap();
        assert!(evaluator.evaluate(&mut record, 120).unwrap().is_none());
        assert_eq!(record.state, AlarmState::Ok);

        // Second breaching period: still holding.
        stream.record(&series, 130, 0.0).unwrap();
        assert!(evaluator.evaluate(&mut record, 180).unwrap().is_none());
        assert_eq!(record.state, AlarmState::Ok);

        // Third consecutive breaching period trips the alarm.
        stream.record(&series, 190, 0.0).unwrap();
        let t = evaluator.evaluate(&mut record, 240).unwrap().unwrap();
        assert_eq!(t.from, AlarmState::Ok);
        assert_eq!(t.to, AlarmState::Alarm);
        assert_eq!(record.state, AlarmState::Alarm);
        assert!(t.reason.contains("3/3"));
    }

    #[test]
    fn single_clearing_period_recovers() {
        let (_, stream, evaluator) = harness();
        let series = success_series("waf");
        let mut record =
            AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::NotBreaching), 0);

        stream.record(&series, 30, 0.0).unwrap();
        stream.record(&series, 90, 0.0).unwrap();
        stream.record(&series, 150, 0.0).unwrap();
        let t = evaluator.evaluate(&mut record, 180).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Alarm);

        // One passing period recovers, no matter the window length.
        stream.record(&series, 190, 1.0).unwrap();
        let t = evaluator.evaluate(&mut record, 240).unwrap().unwrap();
        assert_eq!(t.from, AlarmState::Alarm);
        assert_eq!(t.to, AlarmState::Ok);
        assert!(t.reason.contains("clearing"));
    }

    #[test]
    fn holds_alarm_while_newest_period_breaches() {
        let (_, stream, evaluator) = harness();
        let series = success_series("waf");
        let mut record =
            AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::NotBreaching), 0);
        record.record_transition(AlarmState::Alarm, 100, "test setup");

        // Oldest period clears but the newest still breaches: no recovery.
        stream.record(&series, 450, 1.0).unwrap();
        stream.record(&series, 510, 0.0).unwrap();
        stream.record(&series, 570, 0.0).unwrap();

        assert!(evaluator.evaluate(&mut record, 600).unwrap().is_none());
        assert_eq!(record.state, AlarmState::Alarm);
    }

    #[test]
    fn not_breaching_policy_never_alarms_without_data() {
        let (_, _, evaluator) = harness();
        let mut record =
            AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::NotBreaching), 0);

        for now in [600, 660, 720] {
            evaluator.evaluate(&mut record, now).unwrap();
            assert_ne!(record.state, AlarmState::Alarm);
        }
        assert_eq!(record.state, AlarmState::Ok);
        assert!(record.history.iter().all(|t| t.to != AlarmState::Alarm));
    }

    #[test]
    fn missing_policy_forces_insufficient_data() {
        let (_, stream, evaluator) = harness();
        let series = success_series("waf");
        let mut record = AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::Missing), 0);

        // Full window of passing data settles at OK.
        stream.record(&series, 450, 1.0).unwrap();
        stream.record(&series, 510, 1.0).unwrap();
        stream.record(&series, 570, 1.0).unwrap();
        let t = evaluator.evaluate(&mut record, 600).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Ok);

        // One empty period forces INSUFFICIENT_DATA.
        let t = evaluator.evaluate(&mut record, 660).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::InsufficientData);
        assert!(t.reason.contains("no data"));

        // Breaching data in the newest period does not override the gap
        // left by the period before it.
        stream.record(&series, 670, 0.0).unwrap();
        assert!(evaluator.evaluate(&mut record, 720).unwrap().is_none());
        assert_eq!(record.state, AlarmState::InsufficientData);
    }

    #[test]
    fn breaching_policy_counts_gaps_as_breaching() {
        let (_, _, evaluator) = harness();
        let mut record =
            AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::Breaching), 0);

        let t = evaluator.evaluate(&mut record, 600).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Alarm);
        assert!(t.reason.contains("3/3"));
    }

    #[test]
    fn ignore_policy_shrinks_window_to_data() {
        let (_, stream, evaluator) = harness();
        let series = success_series("waf");
        let mut record = AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::Ignore), 0);

        // Only two of three periods have data; both breach.
        stream.record(&series, 510, 0.0).unwrap();
        stream.record(&series, 570, 0.0).unwrap();

        let t = evaluator.evaluate(&mut record, 600).unwrap().unwrap();
        assert_eq!(t.to, AlarmState::Alarm);
        assert!(t.reason.contains("2/2"));
    }

    #[test]
    fn ignore_policy_holds_when_every_period_is_a_gap() {
        let (_, _, evaluator) = harness();
        let mut record = AlarmRecord::new(test_spec("waf-failing", MissingDataPolicy::Ignore), 0);

        assert!(evaluator.evaluate(&mut record, 600).unwrap().is_none());
        assert_eq!(record.state, AlarmState::InsufficientData);

        // Same with an alarm that had already settled somewhere.
        record.record_transition(AlarmState::Ok, 610, "test setup");
        assert!(evaluator.evaluate(&mut record, 660).unwrap().is_none());
        assert_eq!(record.state, AlarmState::Ok);
    }

    #[tokio::test]
    async fn evaluate_all_persists_and_fires_callback() {
        let (store, stream, _) = harness();

        let mut failing = test_spec("waf-failing", MissingDataPolicy::NotBreaching);
        failing.evaluation_periods = 1;
        let mut healthy = test_spec("api-healthy", MissingDataPolicy::NotBreaching);
        healthy.series = success_series("api");
        healthy.evaluation_periods = 1;

        store.put_alarm(&AlarmRecord::new(failing, 0)).unwrap();
        store.put_alarm(&AlarmRecord::new(healthy, 0)).unwrap();

        stream.record(&success_series("waf"), 570, 0.0).unwrap();
        stream.record(&success_series("api"), 570, 1.0).unwrap();

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        let evaluator = Evaluator::new(store.clone(), Arc::new(stream)).with_transition_fn(
            Arc::new(move |t: AlarmTransition| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().unwrap().push(t);
                })
            }),
        );

        let fired = evaluator.evaluate_all(600).await.unwrap();
        assert_eq!(fired.len(), 2);

        let record = store.get_alarm("waf-failing").unwrap().unwrap();
        assert_eq!(record.state, AlarmState::Alarm);
        assert_eq!(record.last_evaluated_at, Some(600));

        let record = store.get_alarm("api-healthy").unwrap().unwrap();
        assert_eq!(record.state, AlarmState::Ok);

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|t| t.alarm_id == "waf-failing" && t.to == AlarmState::Alarm));
        assert!(events
            .iter()
            .any(|t| t.alarm_id == "api-healthy" && t.to == AlarmState::Ok));
    }

    #[tokio::test]
    async fn steady_state_fires_no_callback() {
        let (store, stream, _) = harness();

        let mut spec = test_spec("waf-failing", MissingDataPolicy::NotBreaching);
        spec.evaluation_periods = 1;
        store.put_alarm(&AlarmRecord::new(spec, 0)).unwrap();
        stream.record(&success_series("waf"), 570, 1.0).unwrap();

        let evaluator = Evaluator::new(store.clone(), Arc::new(stream));
        let fired = evaluator.evaluate_all(600).await.unwrap();
        assert_eq!(fired.len(), 1); // insufficient_data → ok

        // A second tick over the same healthy data changes nothing.
        let fired = evaluator.evaluate_all(660).await.unwrap();
        assert!(fired.is_empty());
        let record = store.get_alarm("waf-failing").unwrap().unwrap();
        assert_eq!(record.last_evaluated_at, Some(660));
    }

    /// Delegates to a real stream but fails every read of one series.
    struct UnreadableSource {
        inner: MetricStream,
        unreadable: SeriesKey,
    }

    impl MetricSource for UnreadableSource {
        fn period_values(
            &self,
            series: &SeriesKey,
            period_secs: u64,
            periods: u32,
            now: u64,
            statistic: Statistic,
        ) -> Result<Vec<Option<f64>>, MetricError> {
            if *series == self.unreadable {
                return Err(MetricError::Fetch(StateError::Read(
                    "injected read failure".to_string(),
                )));
            }
            self.inner
                .period_values(series, period_secs, periods, now, statistic)
        }
    }

    #[tokio::test]
    async fn fetch_failure_holds_state_and_fires_no_callback() {
        let store = StateStore::open_in_memory().unwrap();
        let stream = MetricStream::new(store.clone());

        // The waf alarm is firing when its series becomes unreadable.
        let mut firing_spec = test_spec("waf-failing", MissingDataPolicy::NotBreaching);
        firing_spec.evaluation_periods = 1;
        let mut firing = AlarmRecord::new(firing_spec, 0);
        firing.record_transition(AlarmState::Alarm, 540, "1/1 periods breaching");
        store.put_alarm(&firing).unwrap();

        let mut healthy = test_spec("api-healthy", MissingDataPolicy::NotBreaching);
        healthy.series = success_series("api");
        healthy.evaluation_periods = 1;
        store.put_alarm(&AlarmRecord::new(healthy, 0)).unwrap();
        stream.record(&success_series("api"), 570, 1.0).unwrap();

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        let source = UnreadableSource {
            inner: stream,
            unreadable: success_series("waf"),
        };
        let evaluator = Evaluator::new(store.clone(), Arc::new(source)).with_transition_fn(
            Arc::new(move |t: AlarmTransition| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().unwrap().push(t);
                })
            }),
        );

        let fired = evaluator.evaluate_all(600).await.unwrap();

        // The unreadable alarm holds ALARM untouched; the tick still
        // reaches the healthy alarm.
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alarm_id, "api-healthy");

        let held = store.get_alarm("waf-failing").unwrap().unwrap();
        assert_eq!(held.state, AlarmState::Alarm);
        assert_eq!(held.history.len(), 1);
        assert_eq!(held.last_evaluated_at, None);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alarm_id, "api-healthy");
    }

    #[tokio::test]
    async fn run_loop_shuts_down() {
        let (store, stream, _) = harness();
        let evaluator = Evaluator::new(store, Arc::new(stream));
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(evaluator.run(Duration::from_millis(50), rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
