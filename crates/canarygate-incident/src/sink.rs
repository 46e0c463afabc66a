//! Notification sinks.
//!
//! A sink is the delivery seam for incident notifications: the webhook
//! sink POSTs a JSON payload to an operator-configured endpoint, the
//! tracing sink just logs (the default when no webhook is configured).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use canarygate_state::{AlarmId, AlarmState, IncidentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Wire payload delivered to a sink, once on open and once on resolve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub incident_id: IncidentId,
    pub alarm_id: AlarmId,
    /// Alarm state that triggered this notification.
    pub state: AlarmState,
    pub title: String,
    pub severity: u8,
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The sink could not be reached at all.
    #[error("sink unreachable: {0}")]
    Unreachable(String),
    /// The sink answered with a non-2xx status.
    #[error("sink rejected notification: status {status}")]
    Rejected { status: u16 },
    #[error("notification encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;

/// Delivery seam for notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification to the destination.
    fn dispatch<'a>(&'a self, notification: &'a Notification) -> DispatchFuture<'a>;

    /// Channel reference recorded on incidents (e.g. the webhook URL).
    fn channel(&self) -> Option<String>;
}

/// Log-only sink used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn dispatch<'a>(&'a self, notification: &'a Notification) -> DispatchFuture<'a> {
        Box::pin(async move {
            info!(
                incident = %notification.incident_id,
                alarm = %notification.alarm_id,
                state = ?notification.state,
                severity = notification.severity,
                "{}",
                notification.title
            );
            Ok(())
        })
    }

    fn channel(&self) -> Option<String> {
        None
    }
}

/// POSTs each notification as JSON to a plain-http webhook endpoint.
pub struct WebhookSink {
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl NotificationSink for WebhookSink {
    fn dispatch<'a>(&'a self, notification: &'a Notification) -> DispatchFuture<'a> {
        Box::pin(async move {
            let Some((authority, _)) = split_url(&self.url) else {
                return Err(DispatchError::Unreachable(format!(
                    "unsupported webhook url: {}",
                    self.url
                )));
            };
            let body = serde_json::to_vec(notification)?;

            let result = tokio::time::timeout(self.timeout, async {
                let stream = tokio::net::TcpStream::connect(authority)
                    .await
                    .map_err(|e| DispatchError::Unreachable(format!("connect: {e}")))?;

                let io = hyper_util::rt::TokioIo::new(stream);
                let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                    .await
                    .map_err(|e| DispatchError::Unreachable(format!("handshake: {e}")))?;

                // Drive the connection in the background.
                tokio::spawn(async move {
                    let _ = conn.await;
                });

                let req = http::Request::builder()
                    .method("POST")
                    .uri(&self.url)
                    .header("host", authority)
                    .header("content-type", "application/json")
                    .header("user-agent", "canarygate-incident/0.1")
                    .body(http_body_util::Full::new(bytes::Bytes::from(body)))
                    .map_err(|e| DispatchError::Unreachable(format!("request build: {e}")))?;

                let resp = sender
                    .send_request(req)
                    .await
                    .map_err(|e| DispatchError::Unreachable(format!("request: {e}")))?;
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    Ok(())
                } else {
                    Err(DispatchError::Rejected { status })
                }
            })
            .await;

            match result {
                Ok(inner) => inner,
                Err(_) => Err(DispatchError::Unreachable("dispatch timed out".to_string())),
            }
        })
    }

    fn channel(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

/// Split a plain-http URL into (authority, path-and-query).
fn split_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("http://")?;
    if rest.is_empty() {
        return None;
    }
    Some(match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, "/"),
    })
}
