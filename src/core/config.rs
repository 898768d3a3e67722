use std::time::Duration;

/// Tuning knobs for one download. `Default` matches the CLI defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Upper bound on concurrently running fetch workers.
    pub max_concurrent_threads: usize,
    /// Upper bound on simultaneously active segments. `None` uses
    /// `max_concurrent_threads`.
    pub max_fragments: Option<usize>,
    /// Pause between opening two additional connections.
    pub additional_connection_interval: Duration,
    /// Bytes requested from the connection per read.
    pub buffer_size: usize,
    /// Attempts including the first one.
    pub max_try: u32,
    /// Base delay before a retry; doubles on every further attempt.
    pub retry_interval: Duration,
    /// Per-read timeout, also used as the stall threshold. `None` waits forever.
    pub timeout: Option<Duration>,
    /// How often the stall monitor samples progress.
    pub monitor_tick: Duration,
    /// Worker faults in a row, with no byte received in between, after which
    /// an attempt stops opening connections.
    pub max_worker_faults: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_threads: 6,
            max_fragments: None,
            additional_connection_interval: Duration::from_millis(500),
            buffer_size: 64 * 1024,
            max_try: 3,
            retry_interval: Duration::from_millis(400),
            timeout: Some(Duration::from_secs(60)),
            monitor_tick: Duration::from_millis(250),
            max_worker_faults: 8,
        }
    }
}

impl DownloadConfig {
    pub fn threads(&self) -> usize {
        self.max_concurrent_threads.max(1)
    }

    pub fn fragments(&self) -> usize {
        self.max_fragments.unwrap_or(self.max_concurrent_threads).max(1)
    }

    pub fn buffer(&self) -> usize {
        self.buffer_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_default_to_thread_count() {
        let cfg = DownloadConfig { max_concurrent_threads: 3, ..Default::default() };
        assert_eq!(cfg.fragments(), 3);

        let cfg = DownloadConfig { max_fragments: Some(9), ..cfg };
        assert_eq!(cfg.fragments(), 9);
    }

    #[test]
    fn zero_values_are_raised_to_one() {
        let cfg = DownloadConfig { max_concurrent_threads: 0, buffer_size: 0, ..Default::default() };
        assert_eq!(cfg.threads(), 1);
        assert_eq!(cfg.fragments(), 1);
        assert_eq!(cfg.buffer(), 1);
    }
}
