//! conductor-rollout — the four rollout algorithms.
//!
//! Each deployment resolves one [`DeploymentStrategy`] at creation time;
//! [`execute`] dispatches on it exactly once. Every executor drives the
//! scheduler through [`RolloutContext`], which races each suspension point
//! against the deployment's cancel token and tracks the environments the
//! executor created so they can be removed on failure.
//!
//! # Components
//!
//! - **`strategy`** — strategy inference and canary sizing
//! - **`slots`** — blue/green environment naming and live-slot discovery
//! - **`context`** — shared executor plumbing (cancellation, cleanup, logging)
//! - **`rolling`**, **`blue_green`**, **`canary`**, **`recreate`** — executors
//!
//! [`DeploymentStrategy`]: conductor_core::DeploymentStrategy

pub mod blue_green;
pub mod canary;
pub mod context;
pub mod error;
pub mod recreate;
pub mod rolling;
pub mod slots;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use context::{RolloutContext, RolloutPhase, RolloutReport};
pub use error::{RolloutError, RolloutResult};
pub use slots::{Slot, SlotNames};
pub use strategy::{canary_replicas, is_production, resolve_strategy};

use conductor_core::DeploymentStrategy;

/// Run the deployment's resolved strategy to completion.
pub async fn execute(ctx: &mut RolloutContext) -> RolloutResult<RolloutReport> {
    match ctx.strategy() {
        DeploymentStrategy::RollingUpdate => rolling::run(ctx).await,
        DeploymentStrategy::BlueGreen => blue_green::run(ctx).await,
        DeploymentStrategy::Canary => canary::run(ctx).await,
        DeploymentStrategy::Recreate => recreate::run(ctx).await,
    }
}
