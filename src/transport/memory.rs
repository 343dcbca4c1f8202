// src/transport/memory.rs
// Reference in-memory pub/sub transport. Several `MemoryTransport` handles
// constructed from the same `MemoryNetwork` behave like independent peers
// publishing and subscribing on a shared overlay — this is what the
// integration tests use in place of a real Waku node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ConnectionState, ConnectionStateHandler, HistoricalMessage, MessageHandler, SubscriptionToken, Transport};
use crate::error::{ChatError, Result};

#[derive(Default)]
struct Topic {
    history: Vec<HistoricalMessage>,
    subscribers: HashMap<u64, MessageHandler>,
}

/// The shared "overlay": every `MemoryTransport` built against the same
/// `MemoryNetwork` sees the same topics.
#[derive(Default)]
pub struct MemoryNetwork {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryNetwork { topics: Mutex::new(HashMap::new()) })
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    connected: AtomicBool,
    next_token: AtomicU64,
    state_handlers: Mutex<Vec<ConnectionStateHandler>>,
    always_fail: bool,
}

impl MemoryTransport {
    pub fn new(network: &Arc<MemoryNetwork>) -> Self {
        MemoryTransport {
            network: Arc::clone(network),
            connected: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            state_handlers: Mutex::new(Vec::new()),
            always_fail: false,
        }
    }

    /// A transport whose `publish` always fails, for exercising
    /// `reliable_publish`'s retry-exhaustion path.
    pub fn new_always_failing() -> Self {
        MemoryTransport {
            network: MemoryNetwork::new(),
            connected: AtomicBool::new(true),
            next_token: AtomicU64::new(1),
            state_handlers: Mutex::new(Vec::new()),
            always_fail: true,
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        for handler in self.state_handlers.lock().unwrap_or_else(|p| p.into_inner()).iter() {
            handler(state);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.notify_state(ConnectionState::Connecting);
        self.connected.store(true, Ordering::SeqCst);
        self.notify_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn state(&self) -> ConnectionState {
        if self.is_connected() { ConnectionState::Connected } else { ConnectionState::Disconnected }
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<()> {
        if self.always_fail {
            return Err(ChatError::Publish);
        }
        if !self.is_connected() {
            return Err(ChatError::Publish);
        }

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut topics = self.network.topics.lock().unwrap_or_else(|p| p.into_inner());
        let entry = topics.entry(topic.to_string()).or_default();
        entry.history.push(HistoricalMessage { payload: data.to_vec(), timestamp });
        for handler in entry.subscribers.values() {
            handler(data.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut topics = self.network.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics.entry(topic.to_string()).or_default().subscribers.insert(token, handler);
        Ok(SubscriptionToken(token))
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        let mut topics = self.network.topics.lock().unwrap_or_else(|p| p.into_inner());
        for topic in topics.values_mut() {
            topic.subscribers.remove(&token.0);
        }
        Ok(())
    }

    async fn query_history(
        &self,
        topic: &str,
        since_ms: u64,
        page_size: usize,
    ) -> Result<Vec<HistoricalMessage>> {
        let topics = self.network.topics.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = topics.get(topic) else { return Ok(Vec::new()) };
        Ok(entry
            .history
            .iter()
            .filter(|m| m.timestamp > since_ms)
            .take(page_size)
            .cloned()
            .collect())
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        self.state_handlers.lock().unwrap_or_else(|p| p.into_inner()).push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let network = MemoryNetwork::new();
        let publisher = MemoryTransport::new(&network);
        let subscriber = MemoryTransport::new(&network);
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        subscriber
            .subscribe("topic-a", Arc::new(move |_data| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        publisher.publish("topic-a", b"hello").await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_history_respects_since_and_page_size() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::new(&network);
        transport.connect().await.unwrap();

        for i in 0..5 {
            transport.publish("topic-b", format!("msg-{i}").as_bytes()).await.unwrap();
        }

        let page = transport.query_history("topic-b", 0, 3).await.unwrap();
        assert_eq!(page.len(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let network = MemoryNetwork::new();
        let publisher = MemoryTransport::new(&network);
        let subscriber = MemoryTransport::new(&network);
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        let token = subscriber
            .subscribe("topic-c", Arc::new(move |_| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        subscriber.unsubscribe(token).await.unwrap();
        publisher.publish("topic-c", b"hello").await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }
}
