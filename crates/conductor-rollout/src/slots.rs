//! Blue/green environment slots.
//!
//! A service in an environment is served by at most two scheduler
//! environments, `{service}-{environment}-blue` and
//! `{service}-{environment}-green`, behind one traffic route named
//! `{service}-{environment}`. Whichever slot exists is live; the other is
//! where blue-green and canary stage the next version.

use std::fmt;

use conductor_core::{DeploymentRequest, Scheduler, SubstrateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Blue => Slot::Green,
            Slot::Green => Slot::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Blue => "blue",
            Slot::Green => "green",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler names derived from a request's service and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNames {
    route: String,
}

impl SlotNames {
    pub fn new(service: &str, environment: &str) -> Self {
        Self {
            route: format!("{service}-{environment}"),
        }
    }

    pub fn for_request(request: &DeploymentRequest) -> Self {
        Self::new(&request.service, &request.environment)
    }

    /// Name of the traffic route.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Scheduler environment backing a slot.
    pub fn environment(&self, slot: Slot) -> String {
        format!("{}-{slot}", self.route)
    }

    /// The slot currently serving, with its replica count.
    ///
    /// Blue is preferred when both slots exist (a staging slot left behind
    /// by an interrupted rollout).
    pub async fn live(&self, scheduler: &dyn Scheduler) -> SubstrateResult<Option<(Slot, u32)>> {
        for slot in [Slot::Blue, Slot::Green] {
            if let Some(replicas) = scheduler.replicas(&self.environment(slot)).await? {
                return Ok(Some((slot, replicas)));
            }
        }
        Ok(None)
    }
}
