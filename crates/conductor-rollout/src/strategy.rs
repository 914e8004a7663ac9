//! Strategy resolution — which rollout algorithm a request gets.

use std::sync::LazyLock;

use regex::Regex;

use conductor_core::{DeploymentRequest, DeploymentStrategy};

/// `prod`, `production` or `prd` as the whole name or as its first/last
/// `-`-separated token. Environment names are DNS labels, so lower-case only.
const PRODUCTION_PATTERN: &str =
    r"^(?:prod|production|prd)(?:-.*)?$|^.*-(?:prod|production|prd)$";

static PRODUCTION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(PRODUCTION_PATTERN).ok());

/// Whether an environment name denotes production.
pub fn is_production(environment: &str) -> bool {
    PRODUCTION
        .as_ref()
        .is_some_and(|re| re.is_match(environment))
}

/// Resolve the rollout strategy of a request.
///
/// An explicit strategy always wins. Otherwise production environments get
/// blue-green, requests carrying canary thresholds get canary, and
/// everything else gets a rolling update.
pub fn resolve_strategy(request: &DeploymentRequest) -> DeploymentStrategy {
    if let Some(strategy) = request.strategy {
        return strategy;
    }
    if is_production(&request.environment) {
        DeploymentStrategy::BlueGreen
    } else if request.canary.is_some() {
        DeploymentStrategy::Canary
    } else {
        DeploymentStrategy::RollingUpdate
    }
}

/// Size of a canary environment: a tenth of the target, at least one.
pub fn canary_replicas(replicas: u32) -> u32 {
    (replicas / 10).max(1)
}
