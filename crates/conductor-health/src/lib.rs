//! conductor-health — health gates for rollouts.
//!
//! Turns probe and metrics transports into rollout decisions:
//!
//! ```text
//! HealthEvaluator
//!   └── probe up to `retries` times, `interval` apart → healthy / Unhealthy
//! CanaryEvaluator
//!   └── sample metrics every `sample_interval` over the monitoring window,
//!       keep the latest good sample → promote / abort
//! HttpProbe
//!   └── HealthProbe over plain HTTP/1.1 (2xx = healthy, JSON metrics)
//! ```
//!
//! Transport errors are indistinguishable from "unhealthy" at this layer.

pub mod canary;
pub mod error;
pub mod evaluator;
pub mod probe;

pub use canary::{CanaryEvaluator, CanaryVerdict};
pub use error::{HealthError, HealthResult};
pub use evaluator::{HealthEvaluator, ProbeResult};
pub use probe::HttpProbe;
