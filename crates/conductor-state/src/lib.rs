//! conductor-state — deployment registry and lifecycle broadcaster.
//!
//! The only shared mutable state in Conductor lives here:
//!
//! ```text
//! DeploymentStore
//!   ├── id → Arc<Mutex<Deployment>>   (per-key serialization)
//!   └── EventBus
//!       ├── id → broadcast::Sender<DeploymentEvent>
//!       └── id → broadcast::Sender<DeploymentLog>
//! ```
//!
//! Status transitions are validated and published while the record's
//! lock is held, so events for one deployment reach subscribers in
//! causal order.

pub mod error;
pub mod events;
pub mod store;

pub use error::{StateError, StateResult};
pub use events::{DeploymentEvent, DeploymentLog, DeploymentLogger, EventBus, EventKind, LogLevel};
pub use store::DeploymentStore;
