//! Subcommand implementations.

mod check;
mod simulate;

pub use check::{estimate, validate};
pub use simulate::{SimulateOptions, simulate};

use std::path::Path;

use anyhow::Context;

use conductor_core::DeploymentRequest;

/// Read a deployment request from a JSON file.
pub(crate) fn load_request(path: &Path) -> anyhow::Result<DeploymentRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading request {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing request {}", path.display()))
}
