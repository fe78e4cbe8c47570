use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use popcorn_core::ids::ClientId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SendError;

/// A connected consumer. Dropping it closes its outbound queue, which
/// ends the connection's writer.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected consumers and their outbound queues.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Client>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new client and return its ID + queue receiver.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let rx = self.register_as(id.clone());
        (id, rx)
    }

    /// Register under a caller-chosen ID, replacing any previous holder.
    pub fn register_as(&self, id: ClientId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        self.clients.insert(id.clone(), Client::new(id, tx));
        rx
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn unregister(&self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Queue a text message for one client without waiting.
    pub fn send_to(&self, id: &ClientId, message: String) -> Result<(), SendError> {
        let client = self.clients.get(id).ok_or(SendError::NoSuchClient)?;
        match client.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %id,
                    msg_len = msg.len(),
                    "send queue full"
                );
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    pub fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove clients that haven't answered pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        dead
    }
}

/// Periodically drop clients that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    if !removed.is_empty() {
                        tracing::info!(removed = removed.len(), "dead client cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(queue: usize) -> ClientRegistry {
        ClientRegistry::new(queue, Duration::from_secs(90))
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);
        assert!(id1.as_str().starts_with("client_"));

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id2));
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = registry(32);
        let mut rx = registry.register_as(ClientId::from_raw("c1"));

        registry
            .send_to(&ClientId::from_raw("c1"), "test message".into())
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "test message");
    }

    #[test]
    fn send_to_nonexistent_client() {
        let registry = registry(32);
        assert_eq!(
            registry.send_to(&ClientId::new(), "x".into()),
            Err(SendError::NoSuchClient)
        );
    }

    #[test]
    fn full_queue_is_reported() {
        let registry = registry(2);
        let (id, _rx) = registry.register();
        registry.send_to(&id, "msg1".into()).unwrap();
        registry.send_to(&id, "msg2".into()).unwrap();
        assert_eq!(registry.send_to(&id, "msg3".into()), Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn unregister_closes_the_queue() {
        let registry = registry(4);
        let (id, mut rx) = registry.register();
        registry.send_to(&id, "last".into()).unwrap();
        registry.unregister(&id);
        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = registry(32);
        let (stale, _rx1) = registry.register();
        let (fresh, _rx2) = registry.register();

        if let Some(client) = registry.clients.get(&stale) {
            client.last_pong.store(0, Ordering::Relaxed);
        }
        registry.record_pong(&fresh);

        assert_eq!(registry.cleanup_dead_clients(), vec![stale]);
        assert_eq!(registry.ids(), vec![fresh]);
    }
}
