use crate::application::memory::MemoryStore;
use crate::domain::types::Notification;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process notification fan-out. Broadcasts are serialized behind the
/// write lock; per-agent inboxes are append-only.
pub struct NotificationHub {
    inboxes: Arc<RwLock<BTreeMap<String, Vec<Notification>>>>,
    feed: Arc<RwLock<Vec<Notification>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            inboxes: Arc::new(RwLock::new(BTreeMap::new())),
            feed: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register(&self, agent_id: impl Into<String>) {
        self.inboxes.write().await.entry(agent_id.into()).or_default();
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        self.inboxes.read().await.keys().cloned().collect()
    }

    /// Delivers the notification to every registered agent's inbox.
    pub async fn broadcast(&self, notification: Notification) {
        let mut inboxes = self.inboxes.write().await;
        for (agent_id, inbox) in inboxes.iter_mut() {
            debug!(
                "NotificationHub: delivering {} -> {}",
                notification.sender_agent, agent_id
            );
            inbox.push(notification.clone());
        }
        drop(inboxes);
        self.feed.write().await.push(notification);
    }

    pub async fn inbox(&self, agent_id: &str) -> Vec<Notification> {
        self.inboxes
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent `limit` broadcasts across all senders.
    pub async fn recent(&self, limit: usize) -> Vec<Notification> {
        let feed = self.feed.read().await;
        let start = feed.len().saturating_sub(limit);
        feed[start..].to_vec()
    }

    pub async fn clear(&self) {
        self.inboxes.write().await.values_mut().for_each(Vec::clear);
        self.feed.write().await.clear();
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for NotificationHub {
    fn clone(&self) -> Self {
        Self {
            inboxes: Arc::clone(&self.inboxes),
            feed: Arc::clone(&self.feed),
        }
    }
}

/// Fans a notification out to every registered agent's inbox and writes one
/// memory record per recipient so the broadcast survives into episodic memory.
pub async fn broadcast_and_record(
    hub: &NotificationHub,
    memory: &MemoryStore,
    notification: Notification,
) {
    let recipients = hub.registered_agents().await;
    let writes = recipients.iter().map(|agent_id| {
        let mut metadata = BTreeMap::new();
        metadata.insert("kind".to_string(), "notification".to_string());
        metadata.insert("sender".to_string(), notification.sender_agent.clone());
        metadata.insert("category".to_string(), notification.category.clone());
        let content = format!(
            "Notification from {}: {}",
            notification.sender_agent, notification.content
        );
        async move {
            if let Err(e) = memory.add(content, agent_id.clone(), metadata).await {
                tracing::warn!(
                    "NotificationHub: failed to record notification for {}: {}",
                    agent_id,
                    e
                );
            }
        }
    });
    futures::future::join_all(writes).await;
    hub.broadcast(notification).await;
}
