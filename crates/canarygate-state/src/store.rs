//! StateStore — redb-backed state persistence for canarygate.
//!
//! Provides typed CRUD operations over alarms, rollouts, incidents,
//! metric points, and probe runs. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ALARMS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        txn.open_table(METRIC_POINTS).map_err(map_err!(Table))?;
        txn.open_table(PROBE_RUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Alarms ─────────────────────────────────────────────────────

    /// Insert or update an alarm record.
    pub fn put_alarm(&self, record: &AlarmRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALARMS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "alarm stored");
        Ok(())
    }

    /// Get an alarm by ID.
    pub fn get_alarm(&self, alarm_id: &str) -> StateResult<Option<AlarmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALARMS).map_err(map_err!(Table))?;
        match table.get(alarm_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: AlarmRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all alarms.
    pub fn list_alarms(&self) -> StateResult<Vec<AlarmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALARMS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: AlarmRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an alarm by ID. Returns true if it existed.
    pub fn delete_alarm(&self, alarm_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ALARMS).map_err(map_err!(Table))?;
            existed = table.remove(alarm_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alarm_id, existed, "alarm deleted");
        Ok(existed)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or update a rollout record.
    pub fn put_rollout(&self, record: &RolloutRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "rollout stored");
        Ok(())
    }

    /// Get a rollout by ID.
    pub fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<RolloutRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: RolloutRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RolloutRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a rollout by ID. Returns true if it existed.
    pub fn delete_rollout(&self, rollout_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = table.remove(rollout_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rollout_id, existed, "rollout deleted");
        Ok(existed)
    }

    // ── Incidents ──────────────────────────────────────────────────

    /// Insert or update an incident record.
    pub fn put_incident(&self, record: &IncidentRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "incident stored");
        Ok(())
    }

    /// Get an incident by its composite `{alarm_id}:{incident_id}` key.
    pub fn get_incident(&self, key: &str) -> StateResult<Option<IncidentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: IncidentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all incidents.
    pub fn list_incidents(&self) -> StateResult<Vec<IncidentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: IncidentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List all incidents for a given alarm.
    pub fn list_incidents_for_alarm(&self, alarm_id: &str) -> StateResult<Vec<IncidentRecord>> {
        let prefix = format!("{alarm_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let record: IncidentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // Alarm ids may themselves contain ':', so the key prefix
            // alone is not exact.
            if record.alarm_id == alarm_id {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Find the currently open incident for an alarm, if any.
    ///
    /// The notifier opens at most one incident per alarm, so the first
    /// open record found is the one.
    pub fn open_incident_for_alarm(&self, alarm_id: &str) -> StateResult<Option<IncidentRecord>> {
        let incidents = self.list_incidents_for_alarm(alarm_id)?;
        Ok(incidents
            .into_iter()
            .find(|i| i.status == IncidentStatus::Open))
    }

    // ── Metric points ──────────────────────────────────────────────

    /// Append a metric point to its series.
    ///
    /// One point per (series, second): a same-second rewrite replaces the
    /// stored value.
    pub fn record_metric_point(&self, point: &MetricPoint) -> StateResult<()> {
        let key = point.table_key();
        let value = serde_json::to_vec(point).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(METRIC_POINTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List a series' points with timestamps in `[from, to]`, oldest first.
    ///
    /// Zero-padded timestamp keys make this a single lexicographic range
    /// scan; other series are never touched.
    pub fn list_metric_points(
        &self,
        series: &SeriesKey,
        from: u64,
        to: u64,
    ) -> StateResult<Vec<MetricPoint>> {
        let start = format!("{}|{:020}", series.storage_key(), from);
        let end = format!("{}|{:020}", series.storage_key(), to);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METRIC_POINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..=end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let point: MetricPoint =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // A series' encoding may prefix another's, so the range
            // alone is not exact.
            if point.series == *series {
                results.push(point);
            }
        }
        Ok(results)
    }

    // ── Probe runs ─────────────────────────────────────────────────

    /// Insert a probe run summary.
    pub fn put_probe_run(&self, record: &ProbeRunRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROBE_RUNS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "probe run stored");
        Ok(())
    }

    /// List the most recent runs of a probe, newest first.
    pub fn list_probe_runs(&self, probe: &str, limit: usize) -> StateResult<Vec<ProbeRunRecord>> {
        let start = format!("{probe}|{:020}", 0u64);
        let end = format!("{probe}|{:020}", u64::MAX);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROBE_RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..=end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ProbeRunRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // Probe names may contain '|', so the range alone is not
            // exact.
            if record.probe != probe {
                continue;
            }
            results.push(record);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }
}
