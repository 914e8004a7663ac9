//! conductor-engine — the deployment orchestrator.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── Validator          pre-flight checks, all errors collected
//!   ├── estimate           deterministic duration model
//!   ├── DeploymentStore    records + lifecycle events (conductor-state)
//!   └── per-deployment task
//!         └── conductor_rollout::execute   (nested task, panic-isolated)
//!               └── on FAILED + auto_rollback → Orchestrator::rollback
//! ```

pub mod error;
pub mod estimate;
pub mod orchestrator;
pub mod validator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use validator::{ValidationReport, Validator};
