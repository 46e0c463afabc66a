//! Domain types for the canarygate state store.
//!
//! These types represent the persisted state of alarms, rollouts,
//! incidents, metric series, and probe runs. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Unique identifier for an alarm.
pub type AlarmId = String;

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Unique identifier for an incident.
pub type IncidentId = String;

/// Maximum number of transitions retained in an alarm's history.
const MAX_TRANSITIONS: usize = 64;

// ── Metric series ─────────────────────────────────────────────────

/// Identity of a metric series: namespace, metric name, dimension set.
///
/// Dimensions live in a `BTreeMap` so the storage encoding is
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesKey {
    pub namespace: String,
    pub metric: String,
    pub dimensions: BTreeMap<String, String>,
}

/// A single timestamped observation in a series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub series: SeriesKey,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub value: f64,
}

/// Reduction applied to the points of an evaluation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Sum,
    Average,
    Count,
    Minimum,
    Maximum,
}

// ── Alarm ─────────────────────────────────────────────────────────

/// Comparison between a period statistic and the alarm threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

/// How an evaluation period with no data is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// A gap counts as a clearing period.
    NotBreaching,
    /// A gap counts as a breaching period.
    Breaching,
    /// Gaps are excluded; the window shrinks to the data-bearing periods.
    Ignore,
    /// Any gap forces the alarm into `InsufficientData`.
    Missing,
}

/// Observable state of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Ok,
    Alarm,
    InsufficientData,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub from: AlarmState,
    pub to: AlarmState,
    /// Unix timestamp (seconds) of the evaluation that caused the change.
    pub at: u64,
    pub reason: String,
}

/// Threshold policy an alarm evaluates: what it watches and when it trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmSpec {
    pub id: AlarmId,
    /// Series this alarm watches.
    pub series: SeriesKey,
    pub statistic: Statistic,
    /// Length of one evaluation period in seconds.
    pub period_secs: u64,
    /// Consecutive breaching periods required to enter `Alarm`.
    pub evaluation_periods: u32,
    pub threshold: f64,
    pub comparison: ComparisonOperator,
    pub missing_data: MissingDataPolicy,
}

/// Persisted alarm: its `AlarmSpec` plus the state machine's current position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmRecord {
    pub spec: AlarmSpec,
    pub state: AlarmState,
    /// Bounded transition history, oldest first.
    pub history: Vec<StateTransition>,
    /// Unix timestamp of the last completed evaluation, if any.
    pub last_evaluated_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Rollout ───────────────────────────────────────────────────────

/// One stage of a staged rollout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSpec {
    /// Traffic percentage this stage shifts to (0–100).
    pub percent: u8,
    /// How long to hold at this percentage before advancing.
    pub dwell_secs: u64,
}

/// Configuration of a staged rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutSpec {
    pub id: RolloutId,
    /// Ordered traffic stages, ending at the full-shift percentage.
    pub stages: Vec<StageSpec>,
    /// Alarms whose `Alarm` state blocks (or rolls back) this rollout.
    pub gating_alarms: Vec<AlarmId>,
    /// Revert to 0% on a gating alarm instead of pausing.
    pub auto_rollback: bool,
}

/// Lifecycle phase of a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Shifting traffic stage by stage.
    InProgress,
    /// Held at the current percentage by a gating alarm.
    Paused,
    /// All stages applied and the final dwell elapsed.
    Complete,
    /// Traffic reverted to 0%. Terminal: a new rollout must be started.
    RolledBack { reason: String },
}

/// Persisted rollout: its `RolloutSpec` plus gate progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutRecord {
    pub spec: RolloutSpec,
    pub phase: RolloutPhase,
    /// Number of stages applied so far; `stages[stage_index - 1]` is live.
    pub stage_index: u32,
    /// Currently applied traffic percentage.
    pub percent: u8,
    /// Gating alarms currently in `Alarm`, as last seen by the gate.
    pub blocking_alarms: Vec<AlarmId>,
    /// Unix timestamp the live stage was entered (dwell timer base).
    pub stage_entered_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Incident ──────────────────────────────────────────────────────

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

/// An incident raised when an alarm enters `Alarm`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentRecord {
    pub id: IncidentId,
    pub alarm_id: AlarmId,
    pub title: String,
    /// 1 = highest impact, 5 = lowest.
    pub severity: u8,
    pub status: IncidentStatus,
    /// Notification channel reference (e.g. a webhook URL), if configured.
    pub channel: Option<String>,
    pub opened_at: u64,
    pub resolved_at: Option<u64>,
}

// ── Probe ─────────────────────────────────────────────────────────

/// What a probe step expects from the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedOutcome {
    /// Any 2xx response passes.
    Allow,
    /// Only exactly this status passes; a 2xx is an unexpected allow.
    Deny { status: u16 },
}

/// One step of a synthetic check script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeStep {
    pub name: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub expected: ExpectedOutcome,
    /// Record this step's failure without failing the overall run.
    pub continue_on_failure: bool,
}

/// A complete synthetic check script against one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSpec {
    pub name: String,
    /// Target authority (`host:port`) the steps are issued against.
    pub target: String,
    pub steps: Vec<ProbeStep>,
    /// Per-step timeout in milliseconds.
    pub step_timeout_ms: u64,
    /// Overall run deadline in milliseconds.
    pub run_deadline_ms: u64,
}

/// Why a step failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepFailure {
    /// A response arrived but did not match the expected outcome.
    Validation { status: u16, detail: String },
    /// The request produced no usable response (connect, I/O, timeout).
    Transport { detail: String },
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed { failure: StepFailure },
}

/// Persisted outcome of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    /// Wall time spent on this step in milliseconds.
    pub latency_ms: u64,
    /// Copied from the step so the verdict is auditable from the record.
    pub continue_on_failure: bool,
}

/// Persisted summary of one probe run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeRunRecord {
    pub probe: String,
    pub started_at: u64,
    pub finished_at: u64,
    /// Step outcomes in declaration order.
    pub steps: Vec<StepRecord>,
    /// AND of step verdicts, continue-on-failure failures excluded.
    pub passed: bool,
}

impl SeriesKey {
    pub fn new(namespace: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            metric: metric.into(),
            dimensions: BTreeMap::new(),
        }
    }

    /// Add one dimension (builder style).
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Canonical storage encoding: `namespace/metric{k=v,...}`.
    pub fn storage_key(&self) -> String {
        let mut key = format!("{}/{}", self.namespace, self.metric);
        if !self.dimensions.is_empty() {
            let dims: Vec<String> = self
                .dimensions
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            key.push('{');
            key.push_str(&dims.join(","));
            key.push('}');
        }
        key
    }
}

impl MetricPoint {
    /// Build the composite key for the metric_points table.
    pub fn table_key(&self) -> String {
        format!("{}|{:020}", self.series.storage_key(), self.timestamp)
    }
}

impl ComparisonOperator {
    /// True when `value` breaches `threshold` under this operator.
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterThanOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessThanOrEqual => value <= threshold,
        }
    }
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Alarm => "alarm",
            Self::InsufficientData => "insufficient_data",
        }
    }
}

impl AlarmRecord {
    /// A fresh record in `InsufficientData` with no evaluations yet.
    pub fn new(spec: AlarmSpec, now: u64) -> Self {
        Self {
            spec,
            state: AlarmState::InsufficientData,
            history: Vec::new(),
            last_evaluated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the key for the alarms table.
    pub fn table_key(&self) -> String {
        self.spec.id.clone()
    }

    /// Move to `to`, appending to the bounded transition history.
    pub fn record_transition(&mut self, to: AlarmState, at: u64, reason: impl Into<String>) {
        self.history.push(StateTransition {
            from: self.state,
            to,
            at,
            reason: reason.into(),
        });
        if self.history.len() > MAX_TRANSITIONS {
            let excess = self.history.len() - MAX_TRANSITIONS;
            self.history.drain(..excess);
        }
        self.state = to;
        self.updated_at = at;
    }
}

impl RolloutRecord {
    /// A fresh rollout at 0% traffic with no stages applied.
    pub fn new(spec: RolloutSpec, now: u64) -> Self {
        Self {
            spec,
            phase: RolloutPhase::InProgress,
            stage_index: 0,
            percent: 0,
            blocking_alarms: Vec::new(),
            stage_entered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the key for the rollouts table.
    pub fn table_key(&self) -> String {
        self.spec.id.clone()
    }

    /// The stage currently live, if any stage has been applied yet.
    pub fn current_stage(&self) -> Option<&StageSpec> {
        if self.stage_index == 0 {
            None
        } else {
            self.spec.stages.get(self.stage_index as usize - 1)
        }
    }

    /// Complete and rolled-back rollouts never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            RolloutPhase::Complete | RolloutPhase::RolledBack { .. }
        )
    }
}

impl IncidentRecord {
    /// Build the composite key for the incidents table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.alarm_id, self.id)
    }
}

impl ProbeRunRecord {
    /// Build the composite key for the probe_runs table.
    pub fn table_key(&self) -> String {
        format!("{}|{:020}", self.probe, self.started_at)
    }
}
