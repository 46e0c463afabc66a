//! Probe script execution.
//!
//! Runs the steps of a `ProbeSpec` in declaration order against the
//! target. Each step issues one HTTP/1.1 request and applies its
//! validation predicate to the response status; a per-step timeout runs
//! under an overall run deadline, and once the deadline is exhausted the
//! remaining steps are marked as transport failures without issuing
//! requests.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use canarygate_state::{
    ExpectedOutcome, ProbeRunRecord, ProbeSpec, ProbeStep, StepFailure, StepOutcome, StepRecord,
};

/// Execute every step of the script once, sequentially.
///
/// Never fails: transport problems and validation mismatches both land
/// in the step records, and the overall verdict is the AND of step
/// verdicts with continue-on-failure failures excluded.
pub async fn run_once(spec: &ProbeSpec) -> ProbeRunRecord {
    let started_at = epoch_secs();
    let deadline = Instant::now() + Duration::from_millis(spec.run_deadline_ms);
    let step_timeout = Duration::from_millis(spec.step_timeout_ms);

    let mut steps = Vec::with_capacity(spec.steps.len());
    for step in &spec.steps {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(probe = %spec.name, step = %step.name, "run deadline exhausted, aborting step");
            steps.push(StepRecord {
                name: step.name.clone(),
                outcome: transport("run deadline exceeded".to_string()),
                latency_ms: 0,
                continue_on_failure: step.continue_on_failure,
            });
            continue;
        }

        let begun = Instant::now();
        let outcome = execute_step(&spec.target, step, step_timeout.min(remaining)).await;
        let latency_ms = begun.elapsed().as_millis() as u64;

        if let StepOutcome::Failed { failure } = &outcome {
            debug!(probe = %spec.name, step = %step.name, ?failure, latency_ms, "probe step failed");
        }
        steps.push(StepRecord {
            name: step.name.clone(),
            outcome,
            latency_ms,
            continue_on_failure: step.continue_on_failure,
        });
    }

    let passed = verdict(&steps);
    if !passed {
        warn!(probe = %spec.name, "probe run failed");
    }
    ProbeRunRecord {
        probe: spec.name.clone(),
        started_at,
        finished_at: epoch_secs(),
        steps,
        passed,
    }
}

/// Overall verdict for a run: every step passed, except that failures of
/// continue-on-failure steps are recorded without flipping the verdict.
pub fn verdict(steps: &[StepRecord]) -> bool {
    steps
        .iter()
        .all(|s| matches!(s.outcome, StepOutcome::Passed) || s.continue_on_failure)
}

/// Issue one step's request and classify the response.
async fn execute_step(target: &str, step: &ProbeStep, timeout: Duration) -> StepOutcome {
    let uri = format!("http://{}{}", target, step.path);

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return transport(format!("connect: {e}"));
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return transport(format!("handshake: {e}"));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(step.method.as_str())
            .uri(&uri)
            .header("host", target)
            .header("user-agent", "canarygate-probe/0.1");
        for (name, value) in &step.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = step.body.clone().unwrap_or_default();
        let req = match builder.body(http_body_util::Full::new(bytes::Bytes::from(body))) {
            Ok(req) => req,
            // A malformed method or header never left the process, but it
            // still means the probe could not ask its question.
            Err(e) => return transport(format!("request build: {e}")),
        };

        match sender.send_request(req).await {
            Ok(resp) => classify(resp.status().as_u16(), step),
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                transport(format!("request: {e}"))
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "probe step timed out");
            transport("step timed out".to_string())
        }
    }
}

/// Apply the step's validation predicate to a response status.
fn classify(status: u16, step: &ProbeStep) -> StepOutcome {
    match step.expected {
        ExpectedOutcome::Allow => {
            if (200..300).contains(&status) {
                StepOutcome::Passed
            } else {
                StepOutcome::Failed {
                    failure: StepFailure::Validation {
                        status,
                        detail: format!("expected 2xx, got {status}"),
                    },
                }
            }
        }
        ExpectedOutcome::Deny { status: want } => {
            if status == want {
                StepOutcome::Passed
            } else if (200..300).contains(&status) {
                StepOutcome::Failed {
                    failure: StepFailure::Validation {
                        status,
                        detail: format!("expected {want}, got {status} (unexpected allow)"),
                    },
                }
            } else {
                StepOutcome::Failed {
                    failure: StepFailure::Validation {
                        status,
                        detail: format!("expected {want}, got {status}"),
                    },
                }
            }
        }
    }
}

fn transport(detail: String) -> StepOutcome {
    StepOutcome::Failed {
        failure: StepFailure::Transport { detail },
    }
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
    use std::collections::HashMap;
    use std::net::SocketAddr;

    /// Bind a local target that answers by path: /ok → 200, /fail → 503,
    /// /forbidden → 403, /header → 200 only with the x-probe header,
    /// /slow → 200 after 500ms, anything else → 404.
    async fn spawn_target() -> SocketAddr {
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
                        |req: hyper::Request<hyper::body::Incoming>| async move {
                            let path = req.uri().path().to_string();
                            let has_header = req.headers().get("x-probe").is_some();
                            let status = match path.as_str() {
                                "/ok" => 200,
                                "/fail" => 503,
                                "/forbidden" => 403,
                                "/header" => {
                                    if has_header {
                                        200
                                    } else {
                                        400
                                    }
                                }
                                "/slow" => {
                                    tokio::time::sleep(Duration::from_millis(500)).await;
                                    200
                                }
                                _ => 404,
                            };
                            Ok::<_, std::convert::Infallible>(
                                hyper::Response::builder()
                                    .status(status)
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

    fn step(name: &str, path: &str, expected: ExpectedOutcome) -> ProbeStep {
        ProbeStep {
            name: name.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: None,
            expected,
            continue_on_failure: false,
        }
    }

    fn spec_for(addr: SocketAddr, steps: Vec<ProbeStep>) -> ProbeSpec {
        ProbeSpec {
            name: "waf-canary".to_string(),
            target: addr.to_string(),
            steps,
            step_timeout_ms: 1_000,
            run_deadline_ms: 5_000,
        }
    }

    fn failure_of(record: &StepRecord) -> &StepFailure {
        match &record.outcome {
            StepOutcome::Failed { failure } => failure,
            StepOutcome::Passed => panic!("step unexpectedly passed"),
        }
    }

    #[tokio::test]
    async fn allow_step_passes_on_200() {
        let addr = spawn_target().await;
        let spec = spec_for(addr, vec![step("fetch", "/ok", ExpectedOutcome::Allow)]);

        let run = run_once(&spec).await;
        assert!(run.passed);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].outcome, StepOutcome::Passed);
    }

    #[tokio::test]
    async fn allow_step_fails_on_503() {
        let addr = spawn_target().await;
        let spec = spec_for(addr, vec![step("fetch", "/fail", ExpectedOutcome::Allow)]);

        let run = run_once(&spec).await;
        assert!(!run.passed);
        match failure_of(&run.steps[0]) {
            StepFailure::Validation { status, .. } => assert_eq!(*status, 503),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deny_step_passes_on_exact_status() {
        let addr = spawn_target().await;
        let spec = spec_for(
            addr,
            vec![step(
                "blocked",
                "/forbidden",
                ExpectedOutcome::Deny { status: 403 },
            )],
        );

        let run = run_once(&spec).await;
        assert!(run.passed);
    }

    #[tokio::test]
    async fn deny_step_fails_on_unexpected_allow() {
        let addr = spawn_target().await;
        let spec = spec_for(
            addr,
            vec![step("blocked", "/ok", ExpectedOutcome::Deny { status: 403 })],
        );

        let run = run_once(&spec).await;
        assert!(!run.passed);
        match failure_of(&run.steps[0]) {
            StepFailure::Validation { status, detail } => {
                assert_eq!(*status, 200);
                assert!(detail.contains("unexpected allow"), "detail: {detail}");
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn continue_on_failure_records_without_flipping_verdict() {
        let addr = spawn_target().await;
        let mut tolerated = step("blocked", "/ok", ExpectedOutcome::Deny { status: 403 });
        tolerated.continue_on_failure = true;
        let spec = spec_for(
            addr,
            vec![tolerated, step("fetch", "/ok", ExpectedOutcome::Allow)],
        );

        let run = run_once(&spec).await;
        assert!(run.passed);
        assert!(matches!(run.steps[0].outcome, StepOutcome::Failed { .. }));
        assert_eq!(run.steps[1].outcome, StepOutcome::Passed);
    }

    #[tokio::test]
    async fn steps_execute_in_declaration_order() {
        let addr = spawn_target().await;
        let spec = spec_for(
            addr,
            vec![
                step("first", "/ok", ExpectedOutcome::Allow),
                step("second", "/fail", ExpectedOutcome::Allow),
                step("third", "/forbidden", ExpectedOutcome::Deny { status: 403 }),
            ],
        );

        let run = run_once(&spec).await;
        let names: Vec<&str> = run.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn custom_headers_reach_the_target() {
        let addr = spawn_target().await;
        let mut with_header = step("header", "/header", ExpectedOutcome::Allow);
        with_header
            .headers
            .insert("x-probe".to_string(), "yes".to_string());
        let spec = spec_for(
            addr,
            vec![with_header, step("bare", "/header", ExpectedOutcome::Allow)],
        );

        let run = run_once(&spec).await;
        assert_eq!(run.steps[0].outcome, StepOutcome::Passed);
        // Without the header the target answers 400.
        assert!(matches!(run.steps[1].outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn connect_failure_is_transport() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let spec = spec_for(addr, vec![step("fetch", "/ok", ExpectedOutcome::Allow)]);
        let run = run_once(&spec).await;

        assert!(!run.passed);
        match failure_of(&run.steps[0]) {
            StepFailure::Transport { detail } => {
                assert!(detail.starts_with("connect:"), "detail: {detail}")
            }
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn step_timeout_is_transport() {
        let addr = spawn_target().await;
        let mut spec = spec_for(addr, vec![step("slow", "/slow", ExpectedOutcome::Allow)]);
        spec.step_timeout_ms = 50;

        let run = run_once(&spec).await;
        assert!(!run.passed);
        match failure_of(&run.steps[0]) {
            StepFailure::Transport { detail } => assert_eq!(detail, "step timed out"),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_deadline_aborts_remaining_steps() {
        let addr = spawn_target().await;
        let mut spec = spec_for(
            addr,
            vec![
                step("slow", "/slow", ExpectedOutcome::Allow),
                step("never-a", "/ok", ExpectedOutcome::Allow),
                step("never-b", "/ok", ExpectedOutcome::Allow),
            ],
        );
        // The slow step eats the whole deadline; tokio timers never fire
        // early, so the remaining steps see no time left.
        spec.step_timeout_ms = 1_000;
        spec.run_deadline_ms = 100;

        let run = run_once(&spec).await;
        assert!(!run.passed);
        assert_eq!(run.steps.len(), 3);
        for skipped in &run.steps[1..] {
            match failure_of(skipped) {
                StepFailure::Transport { detail } => assert_eq!(detail, "run deadline exceeded"),
                other => panic!("expected transport failure, got {other:?}"),
            }
            assert_eq!(skipped.latency_ms, 0);
        }
    }

    #[test]
    fn verdict_is_and_of_step_outcomes() {
        let pass = StepRecord {
            name: "a".to_string(),
            outcome: StepOutcome::Passed,
            latency_ms: 1,
            continue_on_failure: false,
        };
        let mut fail = pass.clone();
        fail.outcome = transport("x".to_string());

        assert!(verdict(&[pass.clone(), pass.clone()]));
        assert!(!verdict(&[pass.clone(), fail.clone()]));

        let mut tolerated = fail.clone();
        tolerated.continue_on_failure = true;
        assert!(verdict(&[pass, tolerated]));

        // Vacuously true; empty scripts are rejected at config load.
        assert!(verdict(&[]));
    }
}
