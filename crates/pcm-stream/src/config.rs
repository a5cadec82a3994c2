use std::time::Duration;

/// Streaming tuning parameters shared by the reader, player and device stages.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Reader chunk size as a multiple of the device period.
    pub chunk_periods: usize,
    /// How long the player sleeps when the queue is empty but the reader is still active.
    pub backpressure_sleep: Duration,
    /// Attempts the player makes before giving up on a reader that never produced data.
    pub startup_retries: u32,
    /// Upper bound for the device ring buffer, in microseconds.
    pub max_ring_buffer_micros: u32,
    /// Bounded wait used when the device is not ready to accept frames.
    pub write_wait: Duration,
    /// Poll interval while waiting for a suspended device to resume.
    pub suspend_backoff: Duration,
    /// Relative deviation of the negotiated rate that triggers a warning.
    pub rate_tolerance: f64,
    /// Open the device in non-blocking mode.
    pub nonblocking: bool,
}

impl Default for StreamConfig {
    /// Defaults sized for a ~300 ms hardware ring and 10 ms scheduling granularity.
    fn default() -> Self {
        Self {
            chunk_periods: 3,
            backpressure_sleep: Duration::from_millis(10),
            startup_retries: 3,
            max_ring_buffer_micros: 300_000,
            write_wait: Duration::from_millis(100),
            suspend_backoff: Duration::from_secs(1),
            rate_tolerance: 0.05,
            nonblocking: false,
        }
    }
}
