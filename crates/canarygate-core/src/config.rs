//! canarygate.toml configuration parser.
//!
//! The file shape is forgiving (optional fields with defaults); the daemon
//! converts it into the typed records in `canarygate-state` when seeding
//! the store. Durations are strings in the "30s" / "1m" / "500ms" grammar.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;

use crate::schedule::parse_duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub server: Option<ServerConfig>,
    pub probe: ProbeConfig,
    #[serde(rename = "alarm", default)]
    pub alarms: Vec<AlarmConfig>,
    pub rollout: Option<RolloutConfig>,
    pub incident: Option<IncidentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe name; doubles as the metric dimension value.
    pub name: String,
    /// Target the probe script runs against, as `host:port`.
    pub target: String,
    pub interval: Option<String>,
    pub jitter: Option<String>,
    pub step_timeout: Option<String>,
    pub run_deadline: Option<String>,
    #[serde(rename = "step", default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub method: Option<String>,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// "allow" (expect 2xx) or "deny" (expect `deny_status_code`).
    pub expected_outcome: String,
    pub deny_status_code: Option<u16>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub id: String,
    /// Probe whose series this alarm watches (defaults to the configured probe).
    pub probe: Option<String>,
    /// Metric name within the probe's series ("success" or "duration_ms").
    pub metric: Option<String>,
    pub statistic: Option<String>,
    pub period: Option<String>,
    pub evaluation_periods: Option<u32>,
    pub threshold: f64,
    pub comparison: Option<String>,
    pub missing_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub id: String,
    #[serde(default)]
    pub gating_alarms: Vec<String>,
    pub auto_rollback: Option<bool>,
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub percent: u8,
    pub dwell: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentConfig {
    pub title: Option<String>,
    pub severity: Option<u8>,
    /// Webhook to POST notification payloads to. Absent → log-only sink.
    pub webhook_url: Option<String>,
}

impl GateConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: GateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configs the daemon could not meaningfully run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.probe.steps.is_empty() {
            bail!("probe '{}' has no steps", self.probe.name);
        }
        for step in &self.probe.steps {
            match step.expected_outcome.as_str() {
                "allow" | "deny" => {}
                other => bail!(
                    "step '{}': expected_outcome must be \"allow\" or \"deny\", got \"{other}\"",
                    step.name
                ),
            }
        }
        for field in [
            &self.probe.interval,
            &self.probe.jitter,
            &self.probe.step_timeout,
            &self.probe.run_deadline,
        ]
        .into_iter()
        .flatten()
        {
            if parse_duration(field).is_none() {
                bail!("probe '{}': bad duration \"{field}\"", self.probe.name);
            }
        }
        for alarm in &self.alarms {
            if let Some(period) = &alarm.period
                && parse_duration(period).is_none()
            {
                bail!("alarm '{}': bad period \"{period}\"", alarm.id);
            }
            if alarm.evaluation_periods == Some(0) {
                bail!("alarm '{}': evaluation_periods must be >= 1", alarm.id);
            }
        }
        if let Some(rollout) = &self.rollout {
            if rollout.stages.is_empty() {
                bail!("rollout '{}' has no stages", rollout.id);
            }
            for stage in &rollout.stages {
                if stage.percent > 100 {
                    bail!(
                        "rollout '{}': stage percent {} exceeds 100",
                        rollout.id,
                        stage.percent
                    );
                }
                if let Some(dwell) = &stage.dwell
                    && parse_duration(dwell).is_none()
                {
                    bail!("rollout '{}': bad dwell \"{dwell}\"", rollout.id);
                }
            }
            let alarm_ids: Vec<&str> = self.alarms.iter().map(|a| a.id.as_str()).collect();
            for gating in &rollout.gating_alarms {
                if !alarm_ids.contains(&gating.as_str()) {
                    bail!(
                        "rollout '{}': gating alarm '{gating}' is not configured",
                        rollout.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Scaffold a default config: a two-step WAF probe, a success alarm,
    /// a linear 10%-per-stage rollout gated on it, and an incident plan.
    pub fn scaffold(probe_name: &str, target: &str) -> Self {
        GateConfig {
            server: Some(ServerConfig { port: Some(8843) }),
            probe: ProbeConfig {
                name: probe_name.to_string(),
                target: target.to_string(),
                interval: Some("1m".to_string()),
                jitter: Some("5s".to_string()),
                step_timeout: Some("10s".to_string()),
                run_deadline: Some("50s".to_string()),
                steps: vec![
                    StepConfig {
                        name: "verify valid request allowed".to_string(),
                        method: Some("GET".to_string()),
                        path: "/prod".to_string(),
                        headers: HashMap::new(),
                        expected_outcome: "allow".to_string(),
                        deny_status_code: None,
                        continue_on_failure: false,
                    },
                    StepConfig {
                        name: "verify blocked path traversal attempt".to_string(),
                        method: Some("GET".to_string()),
                        path: "/prod?path=../../traversaldemo".to_string(),
                        headers: HashMap::new(),
                        expected_outcome: "deny".to_string(),
                        deny_status_code: Some(403),
                        continue_on_failure: false,
                    },
                ],
            },
            alarms: vec![AlarmConfig {
                id: format!("{probe_name}-failing"),
                probe: None,
                metric: Some("success".to_string()),
                statistic: Some("sum".to_string()),
                period: Some("1m".to_string()),
                evaluation_periods: Some(1),
                threshold: 1.0,
                comparison: Some("less_than".to_string()),
                missing_data: Some("not_breaching".to_string()),
            }],
            rollout: Some(RolloutConfig {
                id: "prod-shift".to_string(),
                gating_alarms: vec![format!("{probe_name}-failing")],
                auto_rollback: Some(true),
                stages: (1..=10u8)
                    .map(|i| StageConfig {
                        percent: i * 10,
                        dwell: Some("1m".to_string()),
                    })
                    .collect(),
            }),
            incident: Some(IncidentConfig {
                title: Some("Endpoint allowing traffic that should be blocked".to_string()),
                severity: Some(3),
                webhook_url: None,
            }),
        }
    }
}

impl ProbeConfig {
    pub fn interval_duration(&self) -> Duration {
        duration_or(self.interval.as_deref(), Duration::from_secs(60))
    }

    pub fn jitter_duration(&self) -> Duration {
        duration_or(self.jitter.as_deref(), Duration::ZERO)
    }

    pub fn step_timeout_duration(&self) -> Duration {
        duration_or(self.step_timeout.as_deref(), Duration::from_secs(10))
    }

    pub fn run_deadline_duration(&self) -> Duration {
        duration_or(self.run_deadline.as_deref(), Duration::from_secs(50))
    }
}

impl StageConfig {
    pub fn dwell_duration(&self) -> Duration {
        duration_or(self.dwell.as_deref(), Duration::from_secs(60))
    }
}

fn duration_or(s: Option<&str>, default: Duration) -> Duration {
    s.and_then(parse_duration).unwrap_or(default)
}
