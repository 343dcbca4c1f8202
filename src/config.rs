// src/config.rs
// Ambient configuration for the orchestrator and transport wrapper. No
// external config file format is prescribed (construction is programmatic,
// as the defaults below mirror the Implementation Budget's stated values).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    /// Wall-clock deadline for `init`'s connect attempt.
    pub connect_timeout: Duration,
    /// Reliable-send backoff base delay.
    pub retry_base: Duration,
    /// Reliable-send backoff cap.
    pub retry_cap: Duration,
    /// Reliable-send attempt budget before `ErrSendExhausted`.
    pub max_retries: u32,
    /// Dedupe cache time-to-live per entry.
    pub dedupe_ttl: Duration,
    /// Dedupe cache capacity before eviction kicks in.
    pub dedupe_capacity: usize,
    /// Default `page_size` for `query_history` when the caller doesn't specify one.
    pub default_page_size: usize,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            max_retries: 3,
            dedupe_ttl: Duration::from_secs(3600),
            dedupe_capacity: 10_000,
            default_page_size: 100,
        }
    }
}
