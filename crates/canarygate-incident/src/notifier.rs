//! Incident lifecycle driven by alarm transitions.

use std::sync::Arc;
use std::time::Duration;

use canarygate_alarm::AlarmTransition;
use canarygate_state::{AlarmState, IncidentRecord, IncidentStatus, StateStore};
use tracing::{debug, error, info, warn};

use crate::sink::{Notification, NotificationSink};

/// Opens and resolves incidents in the state store as gating alarms
/// transition, pushing a notification to the sink for each change.
///
/// All store and sink failures end in a log line: the evaluator that
/// drives this must never stall on notification trouble.
pub struct IncidentNotifier {
    store: StateStore,
    sink: Arc<dyn NotificationSink>,
    /// Title stamped on incidents this notifier opens.
    title: String,
    /// 1 = highest impact, 5 = lowest.
    severity: u8,
    max_attempts: u32,
    base_backoff: Duration,
}

impl IncidentNotifier {
    pub fn new(store: StateStore, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            sink,
            title: "gating alarm firing".to_string(),
            severity: 3,
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }

    /// Title and severity for incidents opened by this notifier.
    pub fn with_incident_template(mut self, title: impl Into<String>, severity: u8) -> Self {
        self.title = title.into();
        self.severity = severity;
        self
    }

    /// Dispatch retry policy: attempts and initial backoff (doubled
    /// after each failure).
    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.base_backoff = base_backoff;
        self
    }

    /// React to one alarm transition.
    ///
    /// Entering ALARM opens an incident unless one is already open for
    /// the alarm; reaching OK resolves the open incident if there is
    /// one. Transitions into INSUFFICIENT_DATA change nothing, so an
    /// incident survives a data gap and resolves on the eventual OK.
    pub async fn handle_transition(&self, transition: &AlarmTransition) {
        match transition.to {
            AlarmState::Alarm => self.open_incident(transition).await,
            AlarmState::Ok => self.resolve_incident(transition).await,
            AlarmState::InsufficientData => {}
        }
    }

    async fn open_incident(&self, transition: &AlarmTransition) {
        // At most one open incident per alarm, keyed in the store so a
        // restart cannot double-open.
        match self.store.open_incident_for_alarm(&transition.alarm_id) {
            Ok(Some(existing)) => {
                debug!(
                    alarm = %transition.alarm_id,
                    incident = %existing.id,
                    "incident already open, skipping"
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(alarm = %transition.alarm_id, error = %e, "failed to check open incidents");
                return;
            }
        }

        let incident = IncidentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            alarm_id: transition.alarm_id.clone(),
            title: self.title.clone(),
            severity: self.severity,
            status: IncidentStatus::Open,
            channel: self.sink.channel(),
            opened_at: transition.at,
            resolved_at: None,
        };
        if let Err(e) = self.store.put_incident(&incident) {
            error!(alarm = %transition.alarm_id, error = %e, "failed to persist incident");
            return;
        }
        warn!(
            incident = %incident.id,
            alarm = %transition.alarm_id,
            severity = incident.severity,
            reason = %transition.reason,
            "incident opened"
        );

        self.dispatch(&Notification {
            incident_id: incident.id.clone(),
            alarm_id: incident.alarm_id.clone(),
            state: transition.to,
            title: incident.title.clone(),
            severity: incident.severity,
            timestamp: transition.at,
        })
        .await;
    }

    async fn resolve_incident(&self, transition: &AlarmTransition) {
        let mut incident = match self.store.open_incident_for_alarm(&transition.alarm_id) {
            Ok(Some(incident)) => incident,
            Ok(None) => return,
            Err(e) => {
                error!(alarm = %transition.alarm_id, error = %e, "failed to check open incidents");
                return;
            }
        };

        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(transition.at);
        if let Err(e) = self.store.put_incident(&incident) {
            error!(incident = %incident.id, error = %e, "failed to persist incident resolution");
            return;
        }
        info!(incident = %incident.id, alarm = %transition.alarm_id, "incident resolved");

        self.dispatch(&Notification {
            incident_id: incident.id.clone(),
            alarm_id: incident.alarm_id.clone(),
            state: transition.to,
            title: incident.title.clone(),
            severity: incident.severity,
            timestamp: transition.at,
        })
        .await;
    }

    /// Deliver with bounded doubling backoff; delivery is best-effort
    /// and a final failure is only logged.
    async fn dispatch(&self, notification: &Notification) {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.base_backoff;
        for attempt in 1..=attempts {
            match self.sink.dispatch(notification).await {
                Ok(()) => {
                    debug!(incident = %notification.incident_id, attempt, "notification dispatched");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        incident = %notification.incident_id,
                        attempt,
                        error = %e,
                        "notification dispatch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        incident = %notification.incident_id,
                        attempts,
                        error = %e,
                        "notification dispatch failed, giving up"
                    );
                }
            }
        }
    }
}
