use std::time::Duration;

/// Timing and sizing knobs for the delivery engine and coordinator.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Interval between liveness probes (default: 1s)
    pub heartbeat_interval: Duration,
    /// Sleep when a queue is empty or the store errors (default: 1s)
    pub queue_backoff: Duration,
    /// Delay before an unacknowledged delivery is retried (default: 3s)
    pub retry_delay: Duration,
    /// How long a closed descriptor stays in the store (default: 24h)
    pub descriptor_retention: Duration,
    /// Closed connections older than this are dropped from user lists on startup (default: 7 days)
    pub stale_after: Duration,
    /// Concurrent store lookups during the startup sweep (default: 16)
    pub sweep_concurrency: usize,
    /// Capacity of the coordinator event channel (default: 1024)
    pub event_buffer: usize,
    /// Upper bound on one transport write, ping or close (default: 5s)
    pub transport_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            queue_backoff: Duration::from_secs(1),
            retry_delay: Duration::from_secs(3),
            descriptor_retention: Duration::from_secs(24 * 60 * 60),
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_concurrency: 16,
            event_buffer: 1024,
            transport_timeout: Duration::from_secs(5),
        }
    }
}
