//! Canary metrics evaluator — watch live traffic, then promote or abort.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use conductor_core::{CancelToken, CanaryMetrics, CanaryThresholds, HealthProbe};

use crate::error::HealthResult;

/// Outcome of a canary observation window.
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryVerdict {
    pub promote: bool,
    /// Latest good sample, if any sample succeeded.
    pub metrics: Option<CanaryMetrics>,
    pub samples: u32,
    pub failed_samples: u32,
}

/// Samples canary metrics on a fixed interval over the monitoring window.
#[derive(Clone)]
pub struct CanaryEvaluator {
    probe: Arc<dyn HealthProbe>,
    sample_interval: Duration,
}

impl CanaryEvaluator {
    pub fn new(probe: Arc<dyn HealthProbe>, sample_interval: Duration) -> Self {
        Self {
            probe,
            sample_interval,
        }
    }

    /// Observe `environment` for `thresholds.monitoring_duration`.
    ///
    /// A sample is taken every `sample_interval` and once more when the
    /// window closes. Only the latest good sample is judged; failed samples
    /// are logged and the previous one carries forward. With no good sample
    /// at all the canary is not promoted.
    pub async fn evaluate(
        &self,
        environment: &str,
        thresholds: &CanaryThresholds,
        cancel: &CancelToken,
    ) -> HealthResult<CanaryVerdict> {
        let window = thresholds.monitoring_duration;
        let interval = if self.sample_interval.is_zero() {
            window
        } else {
            self.sample_interval.min(window)
        };
        let deadline = Instant::now() + window;

        info!(%environment, ?window, ?interval, "canary monitoring started");

        let mut latest: Option<CanaryMetrics> = None;
        let mut samples = 0u32;
        let mut failed_samples = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            cancel.sleep(interval.min(remaining)).await?;

            samples += 1;
            match cancel.run(self.probe.sample_metrics(environment)).await? {
                Ok(metrics) => {
                    debug!(
                        %environment,
                        error_rate = metrics.error_rate,
                        avg_ms = metrics.average_response_time_ms,
                        requests = metrics.request_count,
                        "canary sample"
                    );
                    latest = Some(metrics);
                }
                Err(e) => {
                    failed_samples += 1;
                    warn!(%environment, error = %e, "canary sample failed, keeping previous sample");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        let promote = latest.as_ref().is_some_and(|m| thresholds.admits(m));
        if promote {
            info!(%environment, samples, "canary metrics within thresholds");
        } else {
            warn!(
                %environment,
                samples,
                failed_samples,
                metrics = ?latest,
                "canary metrics outside thresholds"
            );
        }

        Ok(CanaryVerdict {
            promote,
            metrics: latest,
            samples,
            failed_samples,
        })
    }
}
