//! redb table definitions for the canarygate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Time-ordered tables zero-pad the timestamp component of their
//! composite keys so lexicographic order equals chronological order.

use redb::TableDefinition;

/// Alarm records keyed by `{alarm_id}`.
pub const ALARMS: TableDefinition<&str, &[u8]> = TableDefinition::new("alarms");

/// Rollout records keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Incident records keyed by `{alarm_id}:{incident_id}`.
pub const INCIDENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("incidents");

/// Metric points keyed by `{series}|{timestamp:020}`.
pub const METRIC_POINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("metric_points");

/// Probe run summaries keyed by `{probe}|{started_at:020}`.
pub const PROBE_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("probe_runs");
