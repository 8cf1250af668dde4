// Role change event handling
// Provides event-driven notifications for replica set role and health changes

use std::sync::Arc;

use nexus_common::NodeRole;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use super::topology::NodeHealth;

/// Type of topology change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleChangeType {
    /// A node's role changed (e.g. SECONDARY -> PRIMARY)
    RoleChange,
    /// A node became reachable or unreachable
    HealthChange,
    /// A primary is known and differs from the previously known one
    PrimaryElected,
    /// The previously known primary is gone and no new one is known
    PrimaryLost,
}

impl std::fmt::Display for RoleChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleChangeType::RoleChange => write!(f, "ROLE_CHANGE"),
            RoleChangeType::HealthChange => write!(f, "HEALTH_CHANGE"),
            RoleChangeType::PrimaryElected => write!(f, "PRIMARY_ELECTED"),
            RoleChangeType::PrimaryLost => write!(f, "PRIMARY_LOST"),
        }
    }
}

/// Role change event
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangeEvent {
    pub change_type: RoleChangeType,
    /// The affected node
    pub address: String,
    pub previous_role: Option<NodeRole>,
    pub role: NodeRole,
    pub health: NodeHealth,
    /// Election term reported by the node
    pub term: u64,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl RoleChangeEvent {
    fn new(
        change_type: RoleChangeType,
        address: &str,
        previous_role: Option<NodeRole>,
        role: NodeRole,
        health: NodeHealth,
        term: u64,
    ) -> Self {
        Self {
            change_type,
            address: address.to_string(),
            previous_role,
            role,
            health,
            term,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn role_change(
        address: &str,
        previous_role: NodeRole,
        role: NodeRole,
        health: NodeHealth,
        term: u64,
    ) -> Self {
        Self::new(
            RoleChangeType::RoleChange,
            address,
            Some(previous_role),
            role,
            health,
            term,
        )
    }

    pub fn health_change(address: &str, role: NodeRole, health: NodeHealth, term: u64) -> Self {
        Self::new(RoleChangeType::HealthChange, address, None, role, health, term)
    }

    pub fn primary_elected(address: &str, previous_primary_role: Option<NodeRole>, term: u64) -> Self {
        Self::new(
            RoleChangeType::PrimaryElected,
            address,
            previous_primary_role,
            NodeRole::Primary,
            NodeHealth::Healthy,
            term,
        )
    }

    pub fn primary_lost(address: &str, role: NodeRole, health: NodeHealth, term: u64) -> Self {
        Self::new(
            RoleChangeType::PrimaryLost,
            address,
            Some(NodeRole::Primary),
            role,
            health,
            term,
        )
    }
}

/// Trait for handling role change events
///
/// Delivery is at-least-once, handlers must tolerate seeing the same
/// transition twice.
#[async_trait::async_trait]
pub trait RoleChangeListener: Send + Sync {
    async fn on_role_change(&self, event: &RoleChangeEvent);
}

/// Adapts a synchronous closure into a listener
pub struct FnRoleChangeListener<F> {
    handler: F,
}

impl<F> FnRoleChangeListener<F>
where
    F: Fn(&RoleChangeEvent) + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F> RoleChangeListener for FnRoleChangeListener<F>
where
    F: Fn(&RoleChangeEvent) + Send + Sync,
{
    async fn on_role_change(&self, event: &RoleChangeEvent) {
        (self.handler)(event)
    }
}

/// Role change event publisher
/// Manages subscriptions and fans events out to listeners and broadcast receivers
pub struct RoleChangeEventPublisher {
    broadcast_tx: broadcast::Sender<RoleChangeEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn RoleChangeListener>>>>,
}

impl RoleChangeEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));

        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn RoleChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered role change listener, total: {}", listeners.len());
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn publish(&self, event: RoleChangeEvent) {
        debug!(
            "Publishing topology event: {} for {}",
            event.change_type, event.address
        );

        // No receivers is fine
        let _ = self.broadcast_tx.send(event.clone());

        // Snapshot the list so a listener may register another one
        let listeners: Vec<Arc<dyn RoleChangeListener>> =
            self.listeners.read().await.iter().cloned().collect();
        for listener in listeners {
            listener.on_role_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoleChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Logs every topology change
pub struct LoggingRoleChangeListener;

#[async_trait::async_trait]
impl RoleChangeListener for LoggingRoleChangeListener {
    async fn on_role_change(&self, event: &RoleChangeEvent) {
        match event.change_type {
            RoleChangeType::RoleChange => {
                if let Some(previous) = &event.previous_role {
                    warn!(
                        "[Topology] Node {} changed role ({} -> {}, term {})",
                        event.address, previous, event.role, event.term
                    );
                }
            }
            RoleChangeType::HealthChange => match event.health {
                NodeHealth::Healthy => info!("[Topology] Node {} is reachable", event.address),
                NodeHealth::Degraded => warn!("[Topology] Node {} is unreachable", event.address),
            },
            RoleChangeType::PrimaryElected => {
                info!(
                    "[Topology] Primary is now {} (term {})",
                    event.address, event.term
                );
            }
            RoleChangeType::PrimaryLost => {
                warn!("[Topology] Primary {} lost, no primary known", event.address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_publisher() {
        let publisher = RoleChangeEventPublisher::new(16);
        let mut receiver = publisher.subscribe();

        let event = RoleChangeEvent::primary_elected("localhost:27018", Some(NodeRole::Secondary), 2);
        publisher.publish(event).await;

        let received = receiver.try_recv().unwrap();
        assert_eq!(received.change_type, RoleChangeType::PrimaryElected);
        assert_eq!(received.address, "localhost:27018");
        assert_eq!(received.role, NodeRole::Primary);
    }

    #[tokio::test]
    async fn test_listeners_receive_events() {
        let publisher = RoleChangeEventPublisher::new(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        publisher
            .register_listener(Arc::new(FnRoleChangeListener::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .await;
        publisher
            .register_listener(Arc::new(LoggingRoleChangeListener))
            .await;

        publisher
            .publish(RoleChangeEvent::health_change(
                "localhost:27017",
                NodeRole::Unknown,
                NodeHealth::Degraded,
                1,
            ))
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count().await, 2);
    }

    #[test]
    fn test_event_creation() {
        let change = RoleChangeEvent::role_change(
            "localhost:27017",
            NodeRole::Primary,
            NodeRole::Secondary,
            NodeHealth::Healthy,
            3,
        );
        assert_eq!(change.change_type, RoleChangeType::RoleChange);
        assert_eq!(change.previous_role, Some(NodeRole::Primary));

        let lost = RoleChangeEvent::primary_lost(
            "localhost:27017",
            NodeRole::Unknown,
            NodeHealth::Degraded,
            3,
        );
        assert_eq!(lost.change_type.to_string(), "PRIMARY_LOST");
    }
}
