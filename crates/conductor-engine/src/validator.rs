//! Pre-flight validation. Every check runs; all problems are reported.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use conductor_core::{DeploymentRequest, Substrate};

/// Lower-case alphanumerics and hyphens, 1-63 chars, no leading/trailing hyphen.
const DNS_LABEL_PATTERN: &str = r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$";

static DNS_LABEL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(DNS_LABEL_PATTERN).ok());

fn is_dns_label(name: &str) -> bool {
    DNS_LABEL.as_ref().is_some_and(|re| re.is_match(name))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.errors.join("; "))
    }
}

/// Checks a request against its own constraints and the substrate.
#[derive(Clone)]
pub struct Validator {
    substrate: Substrate,
}

impl Validator {
    pub fn new(substrate: Substrate) -> Self {
        Self { substrate }
    }

    pub async fn validate(&self, request: &DeploymentRequest) -> ValidationReport {
        let mut errors = Vec::new();

        for (field, value) in [
            ("service", &request.service),
            ("version", &request.version),
            ("environment", &request.environment),
            ("image", &request.image),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{field} is required"));
            }
        }
        for (field, value) in [
            ("service", &request.service),
            ("environment", &request.environment),
        ] {
            if !value.trim().is_empty() && !is_dns_label(value) {
                errors.push(format!(
                    "{field} {value:?} must be a DNS label (lower-case letters, digits, '-')"
                ));
            }
        }

        if !request.image.trim().is_empty() && !request.version.trim().is_empty() {
            match self
                .substrate
                .registry
                .image_exists(&request.image, &request.version)
                .await
            {
                Ok(true) => {}
                Ok(false) => errors.push(format!("image {} not found", request.image_ref())),
                Err(e) => errors.push(format!("image {} could not be checked: {e}", request.image_ref())),
            }
        }

        match self
            .substrate
            .scheduler
            .validate_manifests(&request.manifests)
            .await
        {
            Ok(problems) => errors.extend(problems.into_iter().map(|p| format!("invalid manifest: {p}"))),
            Err(e) => errors.push(format!("manifests could not be checked: {e}")),
        }

        let resources = &request.resources;
        if resources.cpu_cores.is_nan() || resources.cpu_cores <= 0.0 {
            errors.push("cpu must be greater than zero".to_string());
        }
        if resources.memory_mb == 0 {
            errors.push("memory must be greater than zero".to_string());
        }
        if resources.storage_mb == 0 {
            errors.push("storage must be greater than zero".to_string());
        }
        if request.replicas < 1 {
            errors.push("replicas must be at least 1".to_string());
        }

        let health = &request.health_check;
        if health.retries < 1 {
            errors.push("health check retries must be at least 1".to_string());
        }
        if health.timeout.is_zero() {
            errors.push("health check timeout must be greater than zero".to_string());
        }

        if let Some(canary) = &request.canary {
            if let Some(rate) = canary.max_error_rate {
                if !(0.0..=100.0).contains(&rate) {
                    errors.push(format!("canary max error rate {rate} must be within 0-100"));
                }
            }
            if canary.monitoring_duration.is_some_and(|d| d.is_zero()) {
                errors.push("canary monitoring duration must be greater than zero".to_string());
            }
        }

        debug!(
            service = %request.service,
            version = %request.version,
            errors = errors.len(),
            "request validated"
        );
        ValidationReport::from_errors(errors)
    }
}
