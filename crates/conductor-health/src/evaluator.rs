//! Health evaluator — bounded retries of a readiness probe.

use std::sync::Arc;

use tracing::{debug, info, warn};

use conductor_core::{CancelToken, HealthCheckConfig, HealthProbe};

use crate::error::{HealthError, HealthResult};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe reported healthy.
    Healthy,
    /// The probe answered, but not healthy.
    Unhealthy,
    /// The probe could not be executed (transport error or timeout).
    Failed,
}

/// Retries a probe until it reports healthy or retries run out.
#[derive(Clone)]
pub struct HealthEvaluator {
    probe: Arc<dyn HealthProbe>,
}

impl HealthEvaluator {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// One probe, bounded by the configured timeout.
    pub async fn probe_once(&self, environment: &str, config: &HealthCheckConfig) -> ProbeResult {
        let probe = self.probe.probe(environment, &config.path, config.timeout);
        match tokio::time::timeout(config.timeout, probe).await {
            Ok(Ok(true)) => ProbeResult::Healthy,
            Ok(Ok(false)) => ProbeResult::Unhealthy,
            Ok(Err(e)) => {
                debug!(%environment, error = %e, "health probe failed");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(%environment, timeout = ?config.timeout, "health probe timed out");
                ProbeResult::Failed
            }
        }
    }

    /// Probe `environment` up to `config.retries` times, `config.interval`
    /// apart. Returns the number of attempts it took to see healthy.
    pub async fn wait_healthy(
        &self,
        environment: &str,
        config: &HealthCheckConfig,
        cancel: &CancelToken,
    ) -> HealthResult<u32> {
        let retries = config.retries.max(1);

        for attempt in 1..=retries {
            let result = cancel.run(self.probe_once(environment, config)).await?;
            if result == ProbeResult::Healthy {
                info!(%environment, attempt, "environment healthy");
                return Ok(attempt);
            }

            debug!(%environment, attempt, retries, ?result, "environment not healthy yet");
            if attempt < retries {
                cancel.sleep(config.interval).await?;
            }
        }

        warn!(%environment, attempts = retries, "health checks exhausted");
        Err(HealthError::Unhealthy {
            environment: environment.to_string(),
            attempts: retries,
        })
    }
}
