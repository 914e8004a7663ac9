//! Domain types for the Conductor orchestrator.
//!
//! A `DeploymentRequest` is the immutable input; a `Deployment` is the
//! mutable lifecycle record created for each orchestration attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration;

/// Server-generated, time-ordered deployment identifier.
pub type DeploymentId = String;

// ── Request ───────────────────────────────────────────────────────

/// Immutable description of a rollout to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRequest {
    pub service: String,
    pub version: String,
    pub environment: String,
    /// Image reference without tag; the tag is `version`.
    pub image: String,
    pub replicas: u32,
    /// Explicit strategy. Inferred at creation time when absent.
    #[serde(default)]
    pub strategy: Option<DeploymentStrategy>,
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Raw scheduler manifests, validated by the scheduler.
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_rollback: bool,
    /// Marks this request as itself a rollback.
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub canary: Option<CanaryConfig>,
}

impl DeploymentRequest {
    /// Full image reference (`image:version`).
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// Per-instance resource requirements. All values must be positive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub storage_mb: u64,
}

/// Health probe configuration for a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    /// Timeout per probe.
    #[serde(with = "duration::string")]
    pub timeout: Duration,
    /// Wait between failed probes.
    #[serde(with = "duration::string")]
    pub interval: Duration,
    /// Maximum number of probes before giving up.
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            retries: 5,
        }
    }
}

/// Canary thresholds as supplied by the caller. Missing values fall back
/// to [`CanaryThresholds::default`] or the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CanaryConfig {
    /// Maximum error rate, in percent (0-100).
    #[serde(default)]
    pub max_error_rate: Option<f64>,
    #[serde(default)]
    pub max_response_time_ms: Option<u64>,
    #[serde(default)]
    pub min_request_count: Option<u64>,
    #[serde(default, with = "duration::option")]
    pub monitoring_duration: Option<Duration>,
}

/// Fully resolved canary promotion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryThresholds {
    pub max_error_rate: f64,
    pub max_response_time_ms: u64,
    pub min_request_count: u64,
    #[serde(with = "duration::string")]
    pub monitoring_duration: Duration,
}

impl Default for CanaryThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 5.0,
            max_response_time_ms: 1000,
            min_request_count: 100,
            monitoring_duration: Duration::from_secs(300),
        }
    }
}

impl CanaryThresholds {
    /// Overlay the caller's config on top of these defaults.
    pub fn resolve(&self, config: Option<&CanaryConfig>) -> CanaryThresholds {
        let Some(cfg) = config else {
            return self.clone();
        };
        CanaryThresholds {
            max_error_rate: cfg.max_error_rate.unwrap_or(self.max_error_rate),
            max_response_time_ms: cfg.max_response_time_ms.unwrap_or(self.max_response_time_ms),
            min_request_count: cfg.min_request_count.unwrap_or(self.min_request_count),
            monitoring_duration: cfg.monitoring_duration.unwrap_or(self.monitoring_duration),
        }
    }

    /// Promotion rule: every comparison must hold at once.
    pub fn admits(&self, metrics: &CanaryMetrics) -> bool {
        metrics.error_rate <= self.max_error_rate
            && metrics.average_response_time_ms <= self.max_response_time_ms as f64
            && metrics.request_count >= self.min_request_count
    }
}

// ── Strategy ──────────────────────────────────────────────────────

/// Rollout algorithm, resolved once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    RollingUpdate,
    BlueGreen,
    Canary,
    Recreate,
}

impl DeploymentStrategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RollingUpdate => "rolling_update",
            Self::BlueGreen => "blue_green",
            Self::Canary => "canary",
            Self::Recreate => "recreate",
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
///
/// `Pending → InProgress → {Completed, Failed, Cancelled}`; a pending
/// deployment may also be cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal forward transition.
    pub const fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Cancelled)
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record of one orchestration attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub request: DeploymentRequest,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly when `status` is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    pub strategy: DeploymentStrategy,
    /// Version that was live before this deployment, if known.
    pub previous_version: Option<String>,
    pub error: Option<String>,
}

impl Deployment {
    /// A freshly accepted deployment, not yet started.
    pub fn pending(
        id: DeploymentId,
        request: DeploymentRequest,
        strategy: DeploymentStrategy,
        previous_version: Option<String>,
    ) -> Self {
        Self {
            id,
            request,
            status: DeploymentStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            strategy,
            previous_version,
            error: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.request.service
    }

    pub fn environment(&self) -> &str {
        &self.request.environment
    }

    pub fn version(&self) -> &str {
        &self.request.version
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Live traffic metrics sampled from a canary environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryMetrics {
    /// Error rate in percent (0-100).
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub request_count: u64,
    /// Window the sample covers.
    #[serde(with = "duration::string")]
    pub sample_duration: Duration,
}

/// Query over the deployment registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DeploymentFilter {
    #[default]
    All,
    Status(DeploymentStatus),
    Environment(String),
    Service(String),
    /// Inclusive creation-time range.
    CreatedBetween {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl DeploymentFilter {
    pub fn matches(&self, deployment: &Deployment) -> bool {
        match self {
            Self::All => true,
            Self::Status(status) => deployment.status == *status,
            Self::Environment(env) => deployment.environment() == env,
            Self::Service(service) => deployment.service() == service,
            Self::CreatedBetween { from, to } => {
                deployment.created_at >= *from && deployment.created_at <= *to
            }
        }
    }
}
