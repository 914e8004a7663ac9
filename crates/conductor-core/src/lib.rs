//! conductor-core — shared vocabulary for the Conductor deployment orchestrator.
//!
//! Holds the deployment data model, the abstract interfaces of the
//! collaborators the orchestrator drives (scheduler, registry, health probe,
//! notifier), duration parsing, and `conductor.toml` configuration.

pub mod cancel;
pub mod config;
pub mod duration;
pub mod substrate;
pub mod types;

pub use cancel::{CancelHandle, CancelToken, Cancelled};
pub use config::ConductorConfig;
pub use substrate::{
    EnvironmentSpec, HealthProbe, Notifier, Registry, Scheduler, Substrate, SubstrateError,
    SubstrateResult, TrafficWeight,
};
pub use types::*;
