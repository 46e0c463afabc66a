//! Scheduled probe loop.
//!
//! One `Prober` drives one probe spec: each tick runs the script once,
//! persists the run summary, and reduces it onto the metric stream.
//! Ticks are sequential by construction, so an overrunning run delays
//! the next tick rather than overlapping it.

use tracing::{info, warn};

use canarygate_core::Schedule;
use canarygate_metrics::MetricStream;
use canarygate_state::{ProbeSpec, StateStore};

use crate::runner;

/// Periodic driver for one probe spec.
pub struct Prober {
    spec: ProbeSpec,
    schedule: Schedule,
    store: StateStore,
    stream: MetricStream,
}

impl Prober {
    pub fn new(
        spec: ProbeSpec,
        schedule: Schedule,
        store: StateStore,
        stream: MetricStream,
    ) -> Self {
        Self {
            spec,
            schedule,
            store,
            stream,
        }
    }

    /// Execute one probe run and feed its results downstream.
    ///
    /// Store failures are logged, never raised: a lost point shows up as
    /// a gap in the series.
    pub async fn tick(&self) {
        let run = runner::run_once(&self.spec).await;
        if let Err(e) = self.store.put_probe_run(&run) {
            warn!(probe = %self.spec.name, error = %e, "failed to persist probe run");
        }
        if let Err(e) = self.stream.record_run(&run) {
            warn!(probe = %self.spec.name, error = %e, "failed to record probe metrics");
        }
    }

    /// Run the probe loop until shutdown signal.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            probe = %self.spec.name,
            target = %self.spec.target,
            interval_secs = self.schedule.interval().as_secs(),
            "prober started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.schedule.next_delay()) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!(probe = %self.spec.name, "prober shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;

    use canarygate_metrics::success_series;
    use canarygate_state::{ExpectedOutcome, ProbeStep};

    async fn spawn_ok_target() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let svc = hyper::service::service_fn(
                        |_req: hyper::Request<hyper::body::Incoming>| async move {
                            Ok::<_, std::convert::Infallible>(
                                hyper::Response::builder()
                                    .status(200)
                                    .body(http_body_util::Full::new(bytes::Bytes::new()))
                                    .unwrap(),
                            )
                        },
                    );
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, svc)
                        .await;
                });
            }
        });
        addr
    }

    fn test_spec(addr: SocketAddr) -> ProbeSpec {
        ProbeSpec {
            name: "waf-canary".to_string(),
            target: addr.to_string(),
            steps: vec![ProbeStep {
                name: "fetch".to_string(),
                method: "GET".to_string(),
                path: "/prod".to_string(),
                headers: HashMap::new(),
                body: None,
                expected: ExpectedOutcome::Allow,
                continue_on_failure: false,
            }],
            step_timeout_ms: 1_000,
            run_deadline_ms: 5_000,
        }
    }

    #[tokio::test]
    async fn tick_persists_run_and_metrics() {
        let addr = spawn_ok_target().await;
        let store = StateStore::open_in_memory().unwrap();
        let stream = MetricStream::new(store.clone());
        let prober = Prober::new(
            test_spec(addr),
            Schedule::new(Duration::from_secs(60)),
            store.clone(),
            stream.clone(),
        );

        prober.tick().await;

        let runs = store.list_probe_runs("waf-canary", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].passed);

        let points = stream
            .query(
                &success_series("waf-canary"),
                runs[0].started_at,
                runs[0].finished_at,
            )
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1.0);
    }

    #[tokio::test]
    async fn run_loop_shuts_down() {
        let addr = spawn_ok_target().await;
        let store = StateStore::open_in_memory().unwrap();
        let stream = MetricStream::new(store.clone());
        let prober = Prober::new(
            test_spec(addr),
            Schedule::new(Duration::from_secs(60)),
            store,
            stream,
        );

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { prober.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        handle.await.unwrap();
    }
}
