//! Incident lifecycle for canarygate.
//!
//! When a gating alarm transitions into ALARM, an incident is opened for
//! it (at most one open incident per alarm, keyed in the state store so a
//! restart cannot double-open) and a notification is pushed to the
//! configured sink. When the alarm recovers to OK, the open incident is
//! resolved and a second notification goes out. Transitions into
//! INSUFFICIENT_DATA take no incident action.
//!
//! Notification delivery is best-effort: failures are retried with a
//! doubling backoff and then logged, never surfaced to the evaluator.

pub mod notifier;
pub mod sink;

pub use notifier::IncidentNotifier;
pub use sink::{DispatchError, Notification, NotificationSink, TracingSink, WebhookSink};
