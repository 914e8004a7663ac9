//! Lifecycle events and log lines, broadcast per deployment id.
//!
//! Subscribers may join at any time and only see what is emitted after
//! they subscribe. A lagging subscriber loses its oldest items rather
//! than slowing down the producer.
//!
//! A deployment's channels are dropped once its terminal event is out and
//! no receiver is left. Finished entries that still had receivers are swept
//! whenever another deployment finishes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use conductor_core::{DeploymentId, DeploymentStatus};

/// Default per-deployment channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// What happened to a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
    Completed,
    Failed { error: String },
    Cancelled { reason: String },
}

/// A lifecycle event for a single deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    pub kind: EventKind,
    /// Status after the event.
    pub status: DeploymentStatus,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn new(deployment_id: &str, kind: EventKind, status: DeploymentStatus) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            kind,
            status,
            timestamp: Utc::now(),
        }
    }

    /// The last event a deployment will ever emit.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A human-readable progress line from a running deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentLog {
    pub deployment_id: DeploymentId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

struct Channels {
    events: broadcast::Sender<DeploymentEvent>,
    logs: broadcast::Sender<DeploymentLog>,
    /// The terminal event has been published.
    finished: bool,
}

impl Channels {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (logs, _) = broadcast::channel(capacity);
        Self {
            events,
            logs,
            finished: false,
        }
    }

    fn reclaimable(&self) -> bool {
        self.finished && self.events.receiver_count() == 0 && self.logs.receiver_count() == 0
    }
}

/// Multi-subscriber event and log streams keyed by deployment id.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<DeploymentId, Channels>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to lifecycle events of a deployment.
    pub async fn subscribe_events(&self, deployment_id: &str) -> broadcast::Receiver<DeploymentEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(deployment_id.to_string())
            .or_insert_with(|| Channels::new(self.capacity))
            .events
            .subscribe()
    }

    /// Subscribe to log lines of a deployment.
    pub async fn subscribe_logs(&self, deployment_id: &str) -> broadcast::Receiver<DeploymentLog> {
        let mut channels = self.channels.write().await;
        channels
            .entry(deployment_id.to_string())
            .or_insert_with(|| Channels::new(self.capacity))
            .logs
            .subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub async fn publish(&self, event: DeploymentEvent) {
        let mut channels = self.channels.write().await;
        let chan = channels
            .entry(event.deployment_id.clone())
            .or_insert_with(|| Channels::new(self.capacity));
        debug!(
            deployment_id = %event.deployment_id,
            status = %event.status,
            subscribers = chan.events.receiver_count(),
            "event published"
        );
        let terminal = event.is_terminal();
        let _ = chan.events.send(event);
        if terminal {
            chan.finished = true;
            sweep(&mut channels);
        }
    }

    /// Mark a deployment's streams as complete without publishing, for
    /// subscriptions opened after its terminal event.
    pub async fn finish(&self, deployment_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(chan) = channels.get_mut(deployment_id) {
            chan.finished = true;
        }
        sweep(&mut channels);
    }

    /// Number of deployments with live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Publish a log line. Having no subscribers is not an error.
    pub async fn log(&self, line: DeploymentLog) {
        let channels = self.channels.read().await;
        if let Some(chan) = channels.get(&line.deployment_id) {
            let _ = chan.logs.send(line);
        }
    }

    /// A logger bound to one deployment.
    pub fn logger(&self, deployment_id: &str) -> DeploymentLogger {
        DeploymentLogger {
            deployment_id: deployment_id.to_string(),
            bus: self.clone(),
        }
    }
}

fn sweep(channels: &mut HashMap<DeploymentId, Channels>) {
    let before = channels.len();
    channels.retain(|_, chan| !chan.reclaimable());
    let dropped = before - channels.len();
    if dropped > 0 {
        debug!(dropped, "finished deployment channels dropped");
    }
}

/// Writes to both `tracing` and a deployment's log stream.
#[derive(Clone)]
pub struct DeploymentLogger {
    deployment_id: DeploymentId,
    bus: EventBus,
}

impl DeploymentLogger {
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(deployment_id = %self.deployment_id, "{message}");
        self.emit(LogLevel::Info, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(deployment_id = %self.deployment_id, "{message}");
        self.emit(LogLevel::Warn, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(deployment_id = %self.deployment_id, "{message}");
        self.emit(LogLevel::Error, message).await;
    }

    pub async fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(deployment_id = %self.deployment_id, "{message}");
        self.emit(LogLevel::Debug, message).await;
    }

    async fn emit(&self, level: LogLevel, message: String) {
        self.bus
            .log(DeploymentLog {
                deployment_id: self.deployment_id.clone(),
                level,
                message,
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_events("d-1").await;

        bus.publish(DeploymentEvent::new("d-1", EventKind::Created, DeploymentStatus::Pending))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert!(!event.is_terminal());
    }

    #[tokio::test]
    async fn late_subscriber_misses_prior_events() {
        let bus = EventBus::default();
        bus.publish(DeploymentEvent::new("d-1", EventKind::Created, DeploymentStatus::Pending))
            .await;

        let mut rx = bus.subscribe_events("d-1").await;
        bus.publish(DeploymentEvent::new(
            "d-1",
            EventKind::Completed,
            DeploymentStatus::Completed,
        ))
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Completed);
        assert!(event.is_terminal());
    }

    #[tokio::test]
    async fn streams_are_keyed_by_deployment() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_events("a").await;
        let mut b = bus.subscribe_events("b").await;

        bus.publish(DeploymentEvent::new("b", EventKind::Created, DeploymentStatus::Pending))
            .await;

        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap().deployment_id, "b");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::default();
        let mut first = bus.subscribe_events("d-1").await;
        let mut second = bus.subscribe_events("d-1").await;

        bus.publish(DeploymentEvent::new("d-1", EventKind::Created, DeploymentStatus::Pending))
            .await;

        assert_eq!(first.recv().await.unwrap().kind, EventKind::Created);
        assert_eq!(second.recv().await.unwrap().kind, EventKind::Created);
    }

    #[tokio::test]
    async fn logger_writes_to_log_stream() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_logs("d-1").await;
        let logger = bus.logger("d-1");

        logger.warn("old environment still draining").await;

        let line = rx.recv().await.unwrap();
        assert_eq!(line.level, LogLevel::Warn);
        assert_eq!(line.message, "old environment still draining");
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_producer() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_events("d-1").await;

        for _ in 0..5 {
            bus.publish(DeploymentEvent::new("d-1", EventKind::Created, DeploymentStatus::Pending))
                .await;
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn finished_channels_are_dropped_once_unobserved() {
        let bus = EventBus::default();
        let rx = bus.subscribe_events("d-1").await;
        bus.publish(DeploymentEvent::new(
            "d-1",
            EventKind::Completed,
            DeploymentStatus::Completed,
        ))
        .await;
        // Still observed.
        assert_eq!(bus.channel_count().await, 1);

        drop(rx);
        bus.publish(DeploymentEvent::new("d-2", EventKind::Created, DeploymentStatus::Pending))
            .await;
        bus.publish(DeploymentEvent::new(
            "d-2",
            EventKind::Cancelled {
                reason: "cancelled by user".to_string(),
            },
            DeploymentStatus::Cancelled,
        ))
        .await;
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn late_subscription_to_finished_deployment_is_reclaimed() {
        let bus = EventBus::default();
        bus.publish(DeploymentEvent::new(
            "d-1",
            EventKind::Completed,
            DeploymentStatus::Completed,
        ))
        .await;
        assert_eq!(bus.channel_count().await, 0);

        let rx = bus.subscribe_logs("d-1").await;
        bus.finish("d-1").await;
        assert_eq!(bus.channel_count().await, 1);
        drop(rx);
        bus.finish("d-1").await;
        assert_eq!(bus.channel_count().await, 0);
    }

    #[test]
    fn event_kind_serializes_tagged() {
        let json = serde_json::to_string(&EventKind::Failed {
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"failed","error":"boom"}"#);
    }
}
