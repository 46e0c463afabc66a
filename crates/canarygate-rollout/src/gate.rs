//! Deployment gate — drives rollout records against alarm state.
//!
//! Each tick reconciles every live rollout: a gating alarm in ALARM
//! pauses or rolls back, otherwise the dwell timer decides whether the
//! next stage applies. The gate is the only writer of rollout records;
//! the API shares it behind a lock for cancellation.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use canarygate_state::*;

use crate::traffic::TrafficController;

/// Gate handle shared between the daemon's tick loop and the API.
pub type SharedGate = Arc<RwLock<DeploymentGate>>;

/// Errors from gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("rollout already terminal: {0}")]
    Terminal(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// The gate reconciles rollout records against gating alarm state and
/// applies traffic decisions through the `TrafficController`.
pub struct DeploymentGate {
    store: StateStore,
    traffic: Arc<dyn TrafficController>,
}

impl DeploymentGate {
    /// Create a new gate.
    pub fn new(store: StateStore, traffic: Arc<dyn TrafficController>) -> Self {
        Self { store, traffic }
    }

    /// Reconcile every live rollout once.
    pub async fn tick(&mut self, now: u64) -> anyhow::Result<()> {
        let rollouts = self.store.list_rollouts()?;
        for record in rollouts {
            if record.is_terminal() {
                continue;
            }
            let id = record.spec.id.clone();
            if let Err(e) = self.reconcile(record, now).await {
                error!(rollout = %id, error = %e, "rollout reconcile failed");
            }
        }
        Ok(())
    }

    /// React to an alarm state change without waiting for the next tick.
    ///
    /// The alarm record is already persisted when this runs; reconciling
    /// from the store picks up the new state.
    pub async fn handle_alarm_change(&mut self, alarm_id: &str, now: u64) {
        let rollouts = match self.store.list_rollouts() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to list rollouts");
                return;
            }
        };

        for record in rollouts {
            if record.is_terminal() || !record.spec.gating_alarms.iter().any(|id| id == alarm_id)
            {
                continue;
            }
            let id = record.spec.id.clone();
            if let Err(e) = self.reconcile(record, now).await {
                error!(rollout = %id, error = %e, "rollout reconcile failed");
            }
        }
    }

    /// Cancel a rollout: the same path as an alarm-triggered rollback.
    pub async fn cancel(&mut self, rollout_id: &str, now: u64) -> Result<RolloutRecord, GateError> {
        let mut record = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| GateError::NotFound(rollout_id.to_string()))?;

        if record.is_terminal() {
            return Err(GateError::Terminal(rollout_id.to_string()));
        }

        self.roll_back(&mut record, now, "cancelled by operator")
            .await?;
        Ok(record)
    }

    /// Drive one rollout's state machine forward.
    async fn reconcile(&mut self, mut record: RolloutRecord, now: u64) -> Result<(), GateError> {
        let states = self.gating_states(&record)?;
        let alarming: Vec<AlarmId> = states
            .iter()
            .filter(|(_, s)| *s == AlarmState::Alarm)
            .map(|(id, _)| id.clone())
            .collect();

        if !alarming.is_empty() {
            if record.spec.auto_rollback {
                let reason = format!("gating alarm in ALARM: {}", alarming.join(", "));
                return self.roll_back(&mut record, now, &reason).await;
            }
            return self.block(&mut record, alarming, now).await;
        }

        match &record.phase {
            RolloutPhase::Paused => {
                if states.iter().all(|(_, s)| *s == AlarmState::Ok) {
                    self.resume(&mut record, now).await?;
                } else if !record.blocking_alarms.is_empty() {
                    // Out of ALARM but not yet all OK: stay paused, clear
                    // the blocked-on list.
                    record.blocking_alarms.clear();
                    record.updated_at = now;
                    self.store.put_rollout(&record)?;
                }
                Ok(())
            }
            RolloutPhase::InProgress => self.advance_if_due(&mut record, now).await,
            _ => Ok(()),
        }
    }

    /// Current states of the gating alarms, in spec order.
    fn gating_states(
        &self,
        record: &RolloutRecord,
    ) -> Result<Vec<(AlarmId, AlarmState)>, GateError> {
        let mut states = Vec::with_capacity(record.spec.gating_alarms.len());
        for id in &record.spec.gating_alarms {
            let state = self
                .store
                .get_alarm(id)?
                .map(|a| a.state)
                // An alarm missing from the store cannot vouch for
                // anything.
                .unwrap_or(AlarmState::InsufficientData);
            states.push((id.clone(), state));
        }
        Ok(states)
    }

    /// Apply the next stage if the live stage's dwell has elapsed.
    async fn advance_if_due(
        &mut self,
        record: &mut RolloutRecord,
        now: u64,
    ) -> Result<(), GateError> {
        // The first shift has nothing to dwell on.
        if let Some(stage) = record.current_stage()
            && now.saturating_sub(record.stage_entered_at) < stage.dwell_secs
        {
            return Ok(());
        }

        let next_index = record.stage_index as usize;
        let Some(next) = record.spec.stages.get(next_index).copied() else {
            // Final stage's dwell elapsed with every gate quiet.
            info!(
                rollout = %record.spec.id,
                percent = record.percent,
                "rollout complete"
            );
            record.phase = RolloutPhase::Complete;
            record.updated_at = now;
            self.store.put_rollout(record)?;
            return Ok(());
        };

        if let Err(e) = self.traffic.advance(&record.spec.id, next.percent).await {
            // The shift did not happen; nothing is recorded and the next
            // tick retries.
            warn!(
                rollout = %record.spec.id,
                percent = next.percent,
                error = %e,
                "traffic advance call failed"
            );
            return Ok(());
        }

        info!(
            rollout = %record.spec.id,
            from = record.percent,
            to = next.percent,
            stage = next_index + 1,
            stages = record.spec.stages.len(),
            "stage applied"
        );
        record.stage_index = next_index as u32 + 1;
        record.percent = next.percent;
        record.stage_entered_at = now;
        record.updated_at = now;
        self.store.put_rollout(record)?;
        Ok(())
    }

    /// Pause in place, keeping current traffic, with the firing alarms
    /// surfaced on the record.
    async fn block(
        &mut self,
        record: &mut RolloutRecord,
        alarming: Vec<AlarmId>,
        now: u64,
    ) -> Result<(), GateError> {
        match record.phase {
            RolloutPhase::InProgress => {
                if let Err(e) = self.traffic.pause(&record.spec.id).await {
                    warn!(rollout = %record.spec.id, error = %e, "traffic pause call failed");
                }
                warn!(
                    rollout = %record.spec.id,
                    percent = record.percent,
                    blocking = ?alarming,
                    "rollout paused by gating alarm"
                );
                record.phase = RolloutPhase::Paused;
                record.blocking_alarms = alarming;
                record.updated_at = now;
                self.store.put_rollout(record)?;
            }
            RolloutPhase::Paused => {
                if record.blocking_alarms != alarming {
                    record.blocking_alarms = alarming;
                    record.updated_at = now;
                    self.store.put_rollout(record)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Resume a paused rollout into its current stage; the dwell clock
    /// restarts.
    async fn resume(&mut self, record: &mut RolloutRecord, now: u64) -> Result<(), GateError> {
        if let Err(e) = self.traffic.resume(&record.spec.id).await {
            warn!(rollout = %record.spec.id, error = %e, "traffic resume call failed");
        }
        info!(
            rollout = %record.spec.id,
            percent = record.percent,
            stage = record.stage_index,
            "rollout resumed, all gating alarms ok"
        );
        record.phase = RolloutPhase::InProgress;
        record.blocking_alarms.clear();
        record.stage_entered_at = now;
        record.updated_at = now;
        self.store.put_rollout(record)?;
        Ok(())
    }

    /// Revert traffic to 0% and mark the rollout terminal.
    ///
    /// The record is written even if the traffic call fails: the gate's
    /// decision is the authority, and the failed call is surfaced for
    /// the operator.
    async fn roll_back(
        &mut self,
        record: &mut RolloutRecord,
        now: u64,
        reason: &str,
    ) -> Result<(), GateError> {
        if let Err(e) = self.traffic.rollback(&record.spec.id).await {
            error!(rollout = %record.spec.id, error = %e, "traffic rollback call failed");
        }
        warn!(rollout = %record.spec.id, %reason, "rolling back to stable");
        record.phase = RolloutPhase::RolledBack {
            reason: reason.to_string(),
        };
        record.percent = 0;
        record.blocking_alarms.clear();
        record.updated_at = now;
        self.store.put_rollout(record)?;
        Ok(())
    }
}

/// Drive the gate on a fixed interval until shutdown.
pub async fn run_gate(
    gate: SharedGate,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "deployment gate started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let mut gate = gate.write().await;
                if let Err(e) = gate.tick(epoch_secs()).await {
                    error!(error = %e, "gate tick failed");
                }
            }
            _ = shutdown.changed() => {
                info!("deployment gate shutting down");
                break;
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
