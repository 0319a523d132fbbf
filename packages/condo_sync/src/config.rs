use std::time::Duration;

/// Tunables for the sync engine.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Maximum distance between a placeholder's local timestamp and the
    /// server timestamp for the two to be treated as the same send.
    pub reconciliation_window: Duration,
    /// Events queued per channel before the transport applies backpressure.
    pub channel_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconciliation_window: Duration::from_secs(30),
            channel_buffer: 256,
        }
    }
}
