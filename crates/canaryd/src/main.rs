//! canaryd — the canarygate daemon.
//!
//! Single binary that assembles the gating control loop:
//! - State store (redb)
//! - Synthetic prober
//! - Metric stream
//! - Alarm evaluator
//! - Deployment gate
//! - Incident notifier
//! - REST API
//!
//! # Usage
//!
//! ```text
//! canaryd run --config canarygate.toml --data-dir /var/lib/canarygate
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

use canarygate_alarm::{Evaluator, TransitionCallback};
use canarygate_core::config::{AlarmConfig, ProbeConfig, RolloutConfig};
use canarygate_core::{GateConfig, Schedule, parse_duration};
use canarygate_incident::{IncidentNotifier, NotificationSink, TracingSink, WebhookSink};
use canarygate_metrics::{MetricStream, duration_series, success_series};
use canarygate_probe::Prober;
use canarygate_rollout::{DeploymentGate, InProcessTraffic, SharedGate, run_gate};
use canarygate_state::{
    AlarmRecord, AlarmSpec, ComparisonOperator, ExpectedOutcome, MissingDataPolicy, ProbeSpec,
    ProbeStep, RolloutRecord, RolloutSpec, StageSpec, StateStore, Statistic,
};

#[derive(Parser)]
#[command(name = "canaryd", about = "canarygate daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gating control loop.
    Run {
        /// Path to the canarygate.toml config.
        #[arg(long, default_value = "canarygate.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/canarygate")]
        data_dir: PathBuf,

        /// Port to listen on (overrides `[server].port`).
        #[arg(long)]
        port: Option<u16>,

        /// Deployment gate tick interval in seconds.
        #[arg(long, default_value = "1")]
        gate_interval: u64,
    },
    /// Parse and validate a config file, then exit.
    Validate {
        #[arg(long, default_value = "canarygate.toml")]
        config: PathBuf,
    },
    /// Write a scaffold config for a probe target.
    Init {
        /// Probe name.
        #[arg(long, default_value = "waf")]
        name: String,

        /// Target the probe runs against, as `host:port`.
        #[arg(long)]
        target: String,

        /// Output path.
        #[arg(long, default_value = "canarygate.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,canaryd=debug,canarygate=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            gate_interval,
        } => run_daemon(config, data_dir, port, gate_interval).await,
        Command::Validate { config } => {
            GateConfig::from_file(&config)?;
            println!("✓ {} is valid", config.display());
            Ok(())
        }
        Command::Init {
            name,
            target,
            output,
        } => {
            let scaffold = GateConfig::scaffold(&name, &target);
            std::fs::write(&output, scaffold.to_toml_string()?)?;
            println!("✓ Generated {}", output.display());
            Ok(())
        }
    }
}

async fn run_daemon(
    config_path: PathBuf,
    data_dir: PathBuf,
    port: Option<u16>,
    gate_interval: u64,
) -> anyhow::Result<()> {
    info!("canarygate daemon starting");

    let config = GateConfig::from_file(&config_path)?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("canarygate.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    seed_store(&store, &config)?;

    let stream = MetricStream::new(store.clone());

    // Prober.
    let schedule =
        Schedule::new(config.probe.interval_duration()).with_jitter(config.probe.jitter_duration());
    let prober = Prober::new(
        probe_spec_from(&config.probe),
        schedule,
        store.clone(),
        stream.clone(),
    );
    info!(probe = %config.probe.name, target = %config.probe.target, "prober initialized");

    // Deployment gate, shared with the API for cancellation.
    let traffic = Arc::new(InProcessTraffic::default());
    let gate: SharedGate = Arc::new(RwLock::new(DeploymentGate::new(store.clone(), traffic)));

    // Incident notifier.
    let incident = config.incident.clone().unwrap_or_default();
    let sink: Arc<dyn NotificationSink> = match incident.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookSink::new(url)),
        None => Arc::new(TracingSink),
    };
    let notifier = Arc::new(
        IncidentNotifier::new(store.clone(), sink).with_incident_template(
            incident
                .title
                .unwrap_or_else(|| "gating alarm firing".to_string()),
            incident.severity.unwrap_or(3),
        ),
    );
    info!("incident notifier initialized");

    // Alarm evaluator. The transition callback nudges the gate first
    // (rollback must not wait for the next tick), then runs the
    // incident lifecycle.
    let cb_gate = gate.clone();
    let cb_notifier = notifier.clone();
    let on_transition: TransitionCallback = Arc::new(move |transition| {
        let gate = cb_gate.clone();
        let notifier = cb_notifier.clone();
        Box::pin(async move {
            gate.write()
                .await
                .handle_alarm_change(&transition.alarm_id, transition.at)
                .await;
            notifier.handle_transition(&transition).await;
        })
    });
    let evaluator = Evaluator::new(store.clone(), Arc::new(stream.clone()))
        .with_transition_fn(on_transition);
    let eval_interval = evaluation_interval(&config);
    info!(
        interval_secs = eval_interval.as_secs(),
        alarms = config.alarms.len(),
        "alarm evaluator initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe_shutdown = shutdown_rx.clone();
    let eval_shutdown = shutdown_rx.clone();
    let gate_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let probe_handle = tokio::spawn(async move {
        prober.run(probe_shutdown).await;
    });

    let eval_handle = tokio::spawn(async move {
        evaluator.run(eval_interval, eval_shutdown).await;
    });

    let gate_handle = tokio::spawn(run_gate(
        gate.clone(),
        Duration::from_secs(gate_interval),
        gate_shutdown,
    ));

    // ── Start API server ───────────────────────────────────────

    let router = canarygate_api::build_router(store, gate, vec![config.probe.name.clone()]);
    let port = port
        .or(config.server.as_ref().and_then(|s| s.port))
        .unwrap_or(8843);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = probe_handle.await;
    let _ = eval_handle.await;
    let _ = gate_handle.await;

    info!("canarygate daemon stopped");
    Ok(())
}

/// Seed alarm and rollout records from config.
///
/// Existing records keep their state-machine position — a restart must
/// not reset alarm state or rollout progress. Records whose config entry
/// is gone are pruned, and a terminal rollout is left alone (re-running
/// a finished shift needs a new rollout id).
fn seed_store(store: &StateStore, config: &GateConfig) -> anyhow::Result<()> {
    let now = epoch_secs();

    for alarm in &config.alarms {
        let spec = alarm_spec_from(alarm, &config.probe.name)?;
        match store.get_alarm(&spec.id)? {
            Some(mut existing) => {
                if existing.spec != spec {
                    info!(alarm = %spec.id, "alarm config changed, updating spec");
                    existing.spec = spec;
                    existing.updated_at = now;
                    store.put_alarm(&existing)?;
                }
            }
            None => {
                info!(alarm = %spec.id, "alarm created");
                store.put_alarm(&AlarmRecord::new(spec, now))?;
            }
        }
    }

    let configured: Vec<&str> = config.alarms.iter().map(|a| a.id.as_str()).collect();
    for record in store.list_alarms()? {
        if !configured.contains(&record.spec.id.as_str()) {
            info!(alarm = %record.spec.id, "alarm removed from config, deleting");
            store.delete_alarm(&record.spec.id)?;
        }
    }

    if let Some(rollout) = &config.rollout {
        let spec = rollout_spec_from(rollout);
        match store.get_rollout(&spec.id)? {
            Some(existing) if existing.is_terminal() => {
                warn!(
                    rollout = %spec.id,
                    phase = ?existing.phase,
                    "rollout already terminal; use a new rollout id to shift again"
                );
            }
            Some(mut existing) => {
                if existing.spec != spec {
                    info!(rollout = %spec.id, "rollout config changed, updating spec");
                    existing.spec = spec;
                    existing.updated_at = now;
                    store.put_rollout(&existing)?;
                }
            }
            None => {
                info!(rollout = %spec.id, "rollout created");
                store.put_rollout(&RolloutRecord::new(spec, now))?;
            }
        }
    }

    let configured_rollout = config.rollout.as_ref().map(|r| r.id.as_str());
    for record in store.list_rollouts()? {
        if configured_rollout != Some(record.spec.id.as_str()) {
            info!(rollout = %record.spec.id, "rollout removed from config, deleting");
            store.delete_rollout(&record.spec.id)?;
        }
    }

    Ok(())
}

fn alarm_spec_from(alarm: &AlarmConfig, default_probe: &str) -> anyhow::Result<AlarmSpec> {
    let probe = alarm.probe.as_deref().unwrap_or(default_probe);
    let series = match alarm.metric.as_deref().unwrap_or("success") {
        "success" => success_series(probe),
        "duration_ms" => duration_series(probe),
        other => bail!("alarm '{}': unknown metric \"{other}\"", alarm.id),
    };

    let statistic = match alarm.statistic.as_deref().unwrap_or("sum") {
        "sum" => Statistic::Sum,
        "average" => Statistic::Average,
        "count" => Statistic::Count,
        "minimum" => Statistic::Minimum,
        "maximum" => Statistic::Maximum,
        other => bail!("alarm '{}': unknown statistic \"{other}\"", alarm.id),
    };

    let comparison = match alarm.comparison.as_deref().unwrap_or("less_than") {
        "greater_than" => ComparisonOperator::GreaterThan,
        "greater_than_or_equal" => ComparisonOperator::GreaterThanOrEqual,
        "less_than" => ComparisonOperator::LessThan,
        "less_than_or_equal" => ComparisonOperator::LessThanOrEqual,
        other => bail!("alarm '{}': unknown comparison \"{other}\"", alarm.id),
    };

    let missing_data = match alarm.missing_data.as_deref().unwrap_or("missing") {
        "not_breaching" => MissingDataPolicy::NotBreaching,
        "breaching" => MissingDataPolicy::Breaching,
        "ignore" => MissingDataPolicy::Ignore,
        "missing" => MissingDataPolicy::Missing,
        other => bail!("alarm '{}': unknown missing_data policy \"{other}\"", alarm.id),
    };

    let period = alarm
        .period
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(Duration::from_secs(60));

    Ok(AlarmSpec {
        id: alarm.id.clone(),
        series,
        statistic,
        period_secs: period.as_secs(),
        evaluation_periods: alarm.evaluation_periods.unwrap_or(3),
        threshold: alarm.threshold,
        comparison,
        missing_data,
    })
}

fn rollout_spec_from(rollout: &RolloutConfig) -> RolloutSpec {
    RolloutSpec {
        id: rollout.id.clone(),
        stages: rollout
            .stages
            .iter()
            .map(|s| StageSpec {
                percent: s.percent,
                dwell_secs: s.dwell_duration().as_secs(),
            })
            .collect(),
        gating_alarms: rollout.gating_alarms.clone(),
        auto_rollback: rollout.auto_rollback.unwrap_or(true),
    }
}

fn probe_spec_from(probe: &ProbeConfig) -> ProbeSpec {
    ProbeSpec {
        name: probe.name.clone(),
        target: probe.target.clone(),
        steps: probe
            .steps
            .iter()
            .map(|s| ProbeStep {
                name: s.name.clone(),
                method: s.method.clone().unwrap_or_else(|| "GET".to_string()),
                path: s.path.clone(),
                headers: s.headers.clone(),
                body: None,
                expected: match s.expected_outcome.as_str() {
                    "allow" => ExpectedOutcome::Allow,
                    "deny" => ExpectedOutcome::Deny {
                        status: s.deny_status_code.unwrap_or(403),
                    },
                    // Config validation rejects anything else.
                    _ => unreachable!(),
                },
                continue_on_failure: s.continue_on_failure,
            })
            .collect(),
        step_timeout_ms: probe.step_timeout_duration().as_millis() as u64,
        run_deadline_ms: probe.run_deadline_duration().as_millis() as u64,
    }
}

/// Evaluation cadence: the smallest configured alarm period, so every
/// period boundary is seen about once. Alarms without an explicit period
/// count as 60s.
fn evaluation_interval(config: &GateConfig) -> Duration {
    config
        .alarms
        .iter()
        .map(|a| {
            a.period
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(Duration::from_secs(60))
        })
        .min()
        .unwrap_or(Duration::from_secs(60))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
