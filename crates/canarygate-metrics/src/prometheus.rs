//! Prometheus text exposition format.
//!
//! Renders the current alarm, rollout, and probe status into the
//! Prometheus text exposition format for scraping by a Prometheus server
//! or compatible agent.

use canarygate_state::{AlarmRecord, AlarmState, ProbeRunRecord, RolloutPhase, RolloutRecord};

/// Render control-loop status into Prometheus text format.
///
/// `latest_runs` holds at most one run per probe (the most recent).
pub fn render_prometheus(
    alarms: &[AlarmRecord],
    rollouts: &[RolloutRecord],
    latest_runs: &[ProbeRunRecord],
) -> String {
    let mut out = String::new();

    out.push_str(
        "# HELP canarygate_alarm_state Alarm state (0=ok, 1=alarm, 2=insufficient_data).\n",
    );
    out.push_str("# TYPE canarygate_alarm_state gauge\n");
    for a in alarms {
        out.push_str(&format!(
            "canarygate_alarm_state{{alarm=\"{}\"}} {}\n",
            a.spec.id,
            state_value(a.state)
        ));
    }

    out.push_str("# HELP canarygate_rollout_percent Currently applied traffic percentage.\n");
    out.push_str("# TYPE canarygate_rollout_percent gauge\n");
    for r in rollouts {
        out.push_str(&format!(
            "canarygate_rollout_percent{{rollout=\"{}\"}} {}\n",
            r.spec.id, r.percent
        ));
    }

    out.push_str(
        "# HELP canarygate_rollout_phase Rollout phase (0=in_progress, 1=paused, 2=complete, 3=rolled_back).\n",
    );
    out.push_str("# TYPE canarygate_rollout_phase gauge\n");
    for r in rollouts {
        out.push_str(&format!(
            "canarygate_rollout_phase{{rollout=\"{}\"}} {}\n",
            r.spec.id,
            phase_value(&r.phase)
        ));
    }

    out.push_str("# HELP canarygate_probe_last_success Whether the most recent run passed.\n");
    out.push_str("# TYPE canarygate_probe_last_success gauge\n");
    for run in latest_runs {
        out.push_str(&format!(
            "canarygate_probe_last_success{{probe=\"{}\"}} {}\n",
            run.probe,
            if run.passed { 1 } else { 0 }
        ));
    }

    out.push_str(
        "# HELP canarygate_probe_last_duration_ms Wall time of the most recent run in milliseconds.\n",
    );
    out.push_str("# TYPE canarygate_probe_last_duration_ms gauge\n");
    for run in latest_runs {
        let duration_ms: u64 = run.steps.iter().map(|s| s.latency_ms).sum();
        out.push_str(&format!(
            "canarygate_probe_last_duration_ms{{probe=\"{}\"}} {}\n",
            run.probe, duration_ms
        ));
    }

    out
}

fn state_value(state: AlarmState) -> u8 {
    match state {
        AlarmState::Ok => 0,
        AlarmState::Alarm => 1,
        AlarmState::InsufficientData => 2,
    }
}

fn phase_value(phase: &RolloutPhase) -> u8 {
    match phase {
        RolloutPhase::InProgress => 0,
        RolloutPhase::Paused => 1,
        RolloutPhase::Complete => 2,
        RolloutPhase::RolledBack { .. } => 3,
    }
}
