//! Metric stream error types.

use thiserror::Error;

/// Errors that can occur on the metric stream.
///
/// `Fetch` is the variant alarm evaluation cares about: it means the
/// query backend failed, which is not the same thing as a series gap.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric fetch failed: {0}")]
    Fetch(#[from] canarygate_state::StateError),

    #[error("metric record failed: {0}")]
    Record(canarygate_state::StateError),
}
