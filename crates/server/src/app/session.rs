use crate::transport::{BackpressureGuard, Outbound};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};

/// Live connection bound to a user. A user may hold several at once,
/// one per device; only an epoch bump evicts them.
pub struct ConnectionEntry {
    pub user_id: i64,
    pub connection_id: String,
    pub sender: mpsc::Sender<Outbound>,
    session_epoch: AtomicI64,
    pub backpressure: Arc<BackpressureGuard>,
    closer: Notify,
}

impl ConnectionEntry {
    pub fn new(
        user_id: i64,
        connection_id: String,
        sender: mpsc::Sender<Outbound>,
        session_epoch: i64,
    ) -> Self {
        Self::with_backpressure(
            user_id,
            connection_id,
            sender,
            session_epoch,
            Arc::new(BackpressureGuard::new()),
        )
    }

    /// Shares the guard the connection's writer task already marks, so
    /// deliveries and the maintenance loop observe the same state.
    pub fn with_backpressure(
        user_id: i64,
        connection_id: String,
        sender: mpsc::Sender<Outbound>,
        session_epoch: i64,
        backpressure: Arc<BackpressureGuard>,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            sender,
            session_epoch: AtomicI64::new(session_epoch),
            backpressure,
            closer: Notify::new(),
        }
    }

    pub fn session_epoch(&self) -> i64 {
        self.session_epoch.load(Ordering::SeqCst)
    }

    /// Reauth replaces the epoch the connection was admitted under.
    pub fn refresh_epoch(&self, epoch: i64) {
        self.session_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Asks the connection task to tear the socket down. Works even when
    /// the outbound channel is full, which is exactly when kicks and
    /// backpressure closes need it.
    pub fn request_close(&self) {
        self.closer.notify_one();
    }

    pub async fn closed(&self) {
        self.closer.notified().await;
    }
}

/// userId to the connections it holds on this instance, in bind order.
/// Binding never evicts an earlier device; the cluster route simply
/// moves to the newest connection.
#[derive(Default)]
pub struct SessionRegistry {
    connections: RwLock<HashMap<i64, Vec<Arc<ConnectionEntry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, entry: Arc<ConnectionEntry>) {
        let mut guard = self.connections.write().await;
        guard.entry(entry.user_id).or_default().push(entry);
    }

    /// Removes one connection's binding. Returns true when it was still
    /// present; other devices of the same user stay bound.
    pub async fn unbind_if(&self, user_id: i64, connection_id: &str) -> bool {
        let mut guard = self.connections.write().await;
        let Some(entries) = guard.get_mut(&user_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.connection_id != connection_id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            guard.remove(&user_id);
        }
        removed
    }

    /// Every connection the user holds on this instance.
    pub async fn get_all(&self, user_id: i64) -> Vec<Arc<ConnectionEntry>> {
        self.connections
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// One specific connection of a user, by its id.
    pub async fn find(&self, user_id: i64, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections
            .read()
            .await
            .get(&user_id)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| entry.connection_id == connection_id)
                    .cloned()
            })
    }

    pub async fn contains(&self, user_id: i64) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user_id: i64, connection_id: &str) -> Arc<ConnectionEntry> {
        let (sender, _rx) = mpsc::channel(4);
        Arc::new(ConnectionEntry::new(
            user_id,
            connection_id.to_string(),
            sender,
            0,
        ))
    }

    #[tokio::test]
    async fn bind_keeps_earlier_devices() {
        let registry = SessionRegistry::new();
        registry.bind(entry(1, "a")).await;
        registry.bind(entry(1, "b")).await;
        let all = registry.get_all(1).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].connection_id, "a");
        assert_eq!(all[1].connection_id, "b");
        assert!(registry.find(1, "a").await.is_some());
        assert!(registry.find(1, "c").await.is_none());
    }

    #[tokio::test]
    async fn unbind_only_matching_connection() {
        let registry = SessionRegistry::new();
        registry.bind(entry(1, "a")).await;
        registry.bind(entry(1, "b")).await;
        assert!(registry.unbind_if(1, "a").await);
        // Repeated close of the same connection is a no-op.
        assert!(!registry.unbind_if(1, "a").await);
        assert!(registry.contains(1).await);
        assert!(registry.unbind_if(1, "b").await);
        assert!(!registry.contains(1).await);
        assert!(registry.get_all(1).await.is_empty());
    }

    #[tokio::test]
    async fn epoch_refresh_visible() {
        let entry = entry(1, "a");
        assert_eq!(entry.session_epoch(), 0);
        entry.refresh_epoch(5);
        assert_eq!(entry.session_epoch(), 5);
    }
}
