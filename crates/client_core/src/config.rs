use std::time::Duration;

/// Immutable knobs for the send and receive pipelines, handed to the client
/// once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Pause between two passes of the sender loop.
    pub deliverer_interval: Duration,
    /// Delivery attempts before a record fails with `TooManyAttempts`.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Records still sending after this long fail with `Expired`.
    pub outbox_expiry: Duration,
    /// Longest user text accepted, counted in chars.
    pub max_text_length: usize,
    pub unbox_concurrency: usize,
    /// Bound on a single remote state lookup. `None` waits indefinitely.
    pub remote_lookup_timeout: Option<Duration>,
    pub page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deliverer_interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            outbox_expiry: Duration::from_secs(10 * 60),
            max_text_length: 10_000,
            unbox_concurrency: 8,
            remote_lookup_timeout: Some(Duration::from_secs(10)),
            page_size: 50,
        }
    }
}

impl ClientConfig {
    /// Exponential delay after the given number of failed attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }

    pub fn outbox_expiry_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.outbox_expiry).unwrap_or(chrono::Duration::MAX)
    }
}
