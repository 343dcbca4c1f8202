// src/transport.rs
// Transport contract (C6): the pub/sub abstraction the orchestrator drives,
// content-topic construction/parsing, and the reliable-send wrapper that
// adds retry-with-backoff on top of a transport's bare `publish`.
//
// `Transport` is defined with `async_trait` rather than GAT-based async
// fns, matching the pack's own async-trait-over-dyn-trait convention (see
// the darklock-guard `guard-core` IPC layer).

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;

use crate::config::ChatClientConfig;
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Dm,
    Group,
    System,
}

impl TopicKind {
    fn as_str(self) -> &'static str {
        match self {
            TopicKind::Dm => "dm",
            TopicKind::Group => "group",
            TopicKind::System => "system",
        }
    }
}

const TOPIC_VERSION: u32 = 1;

/// Build a content topic: `/waku-chat/{version}/wkcht-v1-{kind}-{id}/proto`.
pub fn build_topic(kind: TopicKind, id: &str) -> String {
    format!("/waku-chat/{TOPIC_VERSION}/wkcht-v1-{}-{id}/proto", kind.as_str())
}

/// Parses a content topic back into its `(app_version, kind, id)` parts.
/// Rejects anything that doesn't match the grammar exactly.
pub fn parse_topic(topic: &str) -> Result<(u32, TopicKind, String)> {
    let re = Regex::new(r"^/waku-chat/(\d+)/wkcht-v1-(dm|group|system)-([^/]+)/proto$")
        .expect("static topic regex is valid");
    let caps = re
        .captures(topic)
        .ok_or_else(|| ChatError::InvalidTopic(topic.to_string()))?;

    let version: u32 = caps[1]
        .parse()
        .map_err(|_| ChatError::InvalidTopic(topic.to_string()))?;
    let kind = match &caps[2] {
        "dm" => TopicKind::Dm,
        "group" => TopicKind::Group,
        "system" => TopicKind::System,
        _ => unreachable!("regex only matches known kinds"),
    };
    Ok((version, kind, caps[3].to_string()))
}

pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type ConnectionStateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Opaque handle returned by `subscribe`; pass back to `unsubscribe` to
/// stop receiving messages on that topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// A historical message returned by `query_history`.
#[derive(Debug, Clone)]
pub struct HistoricalMessage {
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn state(&self) -> ConnectionState;

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<()>;
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionToken>;
    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()>;

    /// Paged history query. `since_ms` is exclusive; `page_size` bounds the
    /// batch returned in one call — callers page by repeating with the
    /// newest returned timestamp until a short page signals exhaustion.
    async fn query_history(
        &self,
        topic: &str,
        since_ms: u64,
        page_size: usize,
    ) -> Result<Vec<HistoricalMessage>>;

    fn on_connection_state_change(&self, handler: ConnectionStateHandler);
}

/// Wraps `transport.publish` with exponential backoff and +-10% jitter,
/// per the config's `retry_base`/`retry_cap`/`max_retries`. Gives up with
/// `ChatError::SendExhausted` after the configured attempt budget.
pub async fn reliable_publish(
    transport: &dyn Transport,
    topic: &str,
    data: &[u8],
    config: &ChatClientConfig,
) -> Result<()> {
    let mut attempt = 0u32;
    let mut delay = config.retry_base;
    let mut last_error = String::new();

    loop {
        match transport.publish(topic, data).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                attempt += 1;
                if attempt >= config.max_retries {
                    return Err(ChatError::SendExhausted { attempts: attempt, last_error });
                }
                let jitter_factor = rand::thread_rng().gen_range(0.9..=1.1);
                let jittered = delay.mul_f64(jitter_factor);
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(config.retry_cap);
            }
        }
    }
}

pub fn topic_for_direct(conversation_id: &str) -> String {
    build_topic(TopicKind::Dm, conversation_id)
}

pub fn topic_for_group(conversation_id: &str) -> String {
    build_topic(TopicKind::Group, conversation_id)
}

pub fn topic_for_system(user_id: &str) -> String {
    build_topic(TopicKind::System, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip() {
        let topic = build_topic(TopicKind::Group, "deadbeef");
        let (version, kind, id) = parse_topic(&topic).unwrap();
        assert_eq!(version, 1);
        assert_eq!(kind, TopicKind::Group);
        assert_eq!(id, "deadbeef");
    }

    #[test]
    fn malformed_topic_is_rejected() {
        assert!(parse_topic("/waku-chat/1/not-the-right-shape").is_err());
        assert!(parse_topic("/waku-chat/x/wkcht-v1-dm-abc/proto").is_err());
    }

    #[tokio::test]
    async fn reliable_publish_exhausts_after_max_retries() {
        use self::memory::MemoryTransport;

        let transport = MemoryTransport::new_always_failing();
        let config = ChatClientConfig { max_retries: 2, retry_base: Duration::from_millis(1), retry_cap: Duration::from_millis(2), ..ChatClientConfig::default() };

        let result = reliable_publish(&transport, "topic", b"data", &config).await;
        assert!(matches!(result, Err(ChatError::SendExhausted { attempts: 2, .. })));
    }
}
