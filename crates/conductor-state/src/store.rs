//! DeploymentStore — in-memory registry of deployment records.
//!
//! Each record sits behind its own mutex so transitions on different
//! deployments never contend, while transitions on the same deployment
//! are serialized. The store is `Clone` and can be shared across tasks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use conductor_core::{Deployment, DeploymentFilter, DeploymentStatus};

use crate::error::{StateError, StateResult};
use crate::events::{DeploymentEvent, EventBus, EventKind};

type Entry = Arc<Mutex<Deployment>>;

#[derive(Clone, Default)]
pub struct DeploymentStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    bus: EventBus,
}

impl DeploymentStore {
    /// Create a store that publishes lifecycle events on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Store a freshly created deployment and emit `Created`.
    pub async fn insert(&self, deployment: Deployment) -> StateResult<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&deployment.id) {
            return Err(StateError::AlreadyExists(deployment.id));
        }
        let event = DeploymentEvent::new(&deployment.id, EventKind::Created, deployment.status);
        debug!(deployment_id = %deployment.id, "deployment stored");
        entries.insert(deployment.id.clone(), Arc::new(Mutex::new(deployment)));
        // Published under the map lock: nobody can transition the record
        // before `Created` is out.
        self.bus.publish(event).await;
        Ok(())
    }

    /// Snapshot of a deployment.
    pub async fn get(&self, id: &str) -> Option<Deployment> {
        let entry = self.entry(id).await?;
        let deployment = entry.lock().await;
        Some(deployment.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Snapshots matching `filter`, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> Vec<Deployment> {
        let entries: Vec<Entry> = self.entries.read().await.values().cloned().collect();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let deployment = entry.lock().await;
            if filter.matches(&deployment) {
                results.push(deployment.clone());
            }
        }
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        results
    }

    /// Move a deployment to `to`, recording `error` on terminal failure states.
    ///
    /// Sets `completed_at` when the new status is terminal and publishes the
    /// matching event before releasing the record.
    pub async fn transition(
        &self,
        id: &str,
        to: DeploymentStatus,
        error: Option<String>,
    ) -> StateResult<Deployment> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        let mut deployment = entry.lock().await;

        let from = deployment.status;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        deployment.status = to;
        if to.is_terminal() {
            deployment.completed_at = Some(Utc::now());
            deployment.error = error.clone();
        }

        let kind = match to {
            DeploymentStatus::Completed => EventKind::Completed,
            DeploymentStatus::Failed => EventKind::Failed {
                error: error.unwrap_or_default(),
            },
            DeploymentStatus::Cancelled => EventKind::Cancelled {
                reason: error.unwrap_or_default(),
            },
            _ => EventKind::StatusChanged { from, to },
        };
        self.bus.publish(DeploymentEvent::new(id, kind, to)).await;
        debug!(deployment_id = %id, %from, %to, "deployment transitioned");

        Ok(deployment.clone())
    }

    /// Version of the newest completed deployment of `service` in `environment`.
    pub async fn latest_completed_version(&self, service: &str, environment: &str) -> Option<String> {
        let filter = DeploymentFilter::Status(DeploymentStatus::Completed);
        self.list(&filter)
            .await
            .into_iter()
            .find(|d| d.service() == service && d.environment() == environment)
            .map(|d| d.request.version)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn entry(&self, id: &str) -> Option<Entry> {
        self.entries.read().await.get(id).cloned()
    }
}
