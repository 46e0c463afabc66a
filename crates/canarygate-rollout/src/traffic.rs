//! Traffic shifting seam to the external deployment system.
//!
//! The gate decides; a `TrafficController` implementation applies the
//! decision. `InProcessTraffic` is the in-process implementation the
//! daemon uses when no external deployment system is wired, and the one
//! tests use to observe the gate's call sequence.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

/// Boxed future alias for traffic controller calls.
pub type TrafficFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Progress interface of the external deployment system.
///
/// The gate calls these; it does not own the deployment resource
/// lifecycle.
pub trait TrafficController: Send + Sync {
    /// Percentage of traffic currently routed to the new version.
    fn current_percent<'a>(
        &'a self,
        rollout_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u8>> + Send + 'a>>;

    /// Shift traffic to `percent`.
    fn advance<'a>(&'a self, rollout_id: &'a str, percent: u8) -> TrafficFuture<'a>;

    /// Revert all traffic to the prior stable version.
    fn rollback<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a>;

    /// Freeze stage advancement on the deployment side.
    fn pause<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a>;

    /// Unfreeze stage advancement.
    fn resume<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a>;
}

/// In-process traffic table: rollout id → applied percent.
///
/// Keeps an action log so tests can assert the exact call sequence the
/// gate produced.
#[derive(Clone, Default)]
pub struct InProcessTraffic {
    percents: Arc<RwLock<HashMap<String, u8>>>,
    actions: Arc<RwLock<Vec<String>>>,
}

impl InProcessTraffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// The applied percent for a rollout, 0 if traffic never shifted.
    pub async fn percent(&self, rollout_id: &str) -> u8 {
        *self.percents.read().await.get(rollout_id).unwrap_or(&0)
    }

    /// Calls applied so far, as `"{rollout_id} {action}"` lines.
    pub async fn actions(&self) -> Vec<String> {
        self.actions.read().await.clone()
    }

    async fn log(&self, entry: String) {
        self.actions.write().await.push(entry);
    }
}

impl TrafficController for InProcessTraffic {
    fn current_percent<'a>(
        &'a self,
        rollout_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u8>> + Send + 'a>> {
        Box::pin(async move { Ok(self.percent(rollout_id).await) })
    }

    fn advance<'a>(&'a self, rollout_id: &'a str, percent: u8) -> TrafficFuture<'a> {
        Box::pin(async move {
            self.percents
                .write()
                .await
                .insert(rollout_id.to_string(), percent);
            self.log(format!("{rollout_id} advance {percent}")).await;
            info!(rollout = %rollout_id, percent, "traffic shifted");
            Ok(())
        })
    }

    fn rollback<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a> {
        Box::pin(async move {
            self.percents.write().await.insert(rollout_id.to_string(), 0);
            self.log(format!("{rollout_id} rollback")).await;
            info!(rollout = %rollout_id, "traffic reverted to stable");
            Ok(())
        })
    }

    fn pause<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a> {
        Box::pin(async move {
            self.log(format!("{rollout_id} pause")).await;
            Ok(())
        })
    }

    fn resume<'a>(&'a self, rollout_id: &'a str) -> TrafficFuture<'a> {
        Box::pin(async move {
            self.log(format!("{rollout_id} resume")).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advance_and_rollback_track_percent() {
        let traffic = InProcessTraffic::new();
        assert_eq!(traffic.percent("shift").await, 0);

        traffic.advance("shift", 40).await.unwrap();
        assert_eq!(traffic.percent("shift").await, 40);
        assert_eq!(traffic.current_percent("shift").await.unwrap(), 40);

        traffic.rollback("shift").await.unwrap();
        assert_eq!(traffic.percent("shift").await, 0);
    }

    #[tokio::test]
    async fn action_log_preserves_order() {
        let traffic = InProcessTraffic::new();
        traffic.advance("shift", 10).await.unwrap();
        traffic.pause("shift").await.unwrap();
        traffic.resume("shift").await.unwrap();
        traffic.rollback("shift").await.unwrap();

        assert_eq!(
            traffic.actions().await,
            vec![
                "shift advance 10",
                "shift pause",
                "shift resume",
                "shift rollback",
            ]
        );
    }
}
