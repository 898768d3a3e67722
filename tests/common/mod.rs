#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use orange_rangefetch::core::assembler::{MemorySink, Sink};
use orange_rangefetch::core::config::DownloadConfig;
use orange_rangefetch::core::error::{DownloadError, DownloadResult};
use orange_rangefetch::core::model::{ProbeInfo, ResourceDescriptor};
use orange_rangefetch::plugins::registry::{ByteStream, DriverContext, TransferDriver};
use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn random_payload(len: usize) -> Bytes {
    let mut rng = rand::rng();
    Bytes::from((0..len).map(|_| rng.random::<u8>()).collect::<Vec<u8>>())
}

/// Config tuned for tests: short pacing and timeouts.
pub fn fast_config(threads: usize) -> DownloadConfig {
    DownloadConfig {
        max_concurrent_threads: threads,
        max_fragments: None,
        additional_connection_interval: Duration::from_millis(2),
        buffer_size: 4 * 1024,
        max_try: 3,
        retry_interval: Duration::from_millis(5),
        timeout: Some(Duration::from_secs(5)),
        monitor_tick: Duration::from_millis(10),
        max_worker_faults: 8,
    }
}

/// In-memory transport serving one payload.
pub struct MockDriver {
    data: Bytes,
    supports_ranges: bool,
    report_size: bool,
    chunk: usize,
    delay: Duration,
    /// Each range response ends after this many bytes.
    max_response: Option<usize>,
    /// Range responses opened during the first `stall_attempts` attempts
    /// hang after their first chunk.
    stall_attempts: usize,
    /// The first `failing_ranges` range requests fail with a 503.
    failing_ranges: usize,
    /// Every `n`-th range request fails with a 503.
    fail_every: Option<usize>,
    /// Opening a body never completes.
    hanging_opens: bool,
    pub probes: AtomicUsize,
    pub range_opens: AtomicUsize,
    pub full_opens: AtomicUsize,
}

impl MockDriver {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            supports_ranges: true,
            report_size: true,
            chunk: 1024,
            delay: Duration::ZERO,
            max_response: None,
            stall_attempts: 0,
            failing_ranges: 0,
            fail_every: None,
            hanging_opens: false,
            probes: AtomicUsize::new(0),
            range_opens: AtomicUsize::new(0),
            full_opens: AtomicUsize::new(0),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.supports_ranges = false;
        self
    }

    pub fn without_size(mut self) -> Self {
        self.report_size = false;
        self
    }

    pub fn chunked(mut self, chunk: usize, delay: Duration) -> Self {
        self.chunk = chunk.max(1);
        self.delay = delay;
        self
    }

    pub fn truncating(mut self, max_response: usize) -> Self {
        self.max_response = Some(max_response);
        self
    }

    pub fn stalling_attempts(mut self, n: usize) -> Self {
        self.stall_attempts = n;
        self
    }

    pub fn failing_ranges(mut self, n: usize) -> Self {
        self.failing_ranges = n;
        self
    }

    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn hanging_opens(mut self) -> Self {
        self.hanging_opens = true;
        self
    }

    async fn hang_if_asked(&self) {
        if self.hanging_opens {
            std::future::pending::<()>().await;
        }
    }

    fn body(&self, from: usize, limit: Option<usize>, stall: bool) -> ByteStream {
        let end = limit.map_or(self.data.len(), |l| (from + l).min(self.data.len()));
        let data = self.data.slice(from..end);
        let chunk = self.chunk;
        let delay = self.delay;

        let body = stream::unfold(0usize, move |pos| {
            let data = data.clone();
            async move {
                if pos >= data.len() {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let next = (pos + chunk).min(data.len());
                Some((Ok::<Bytes, io::Error>(data.slice(pos..next)), next))
            }
        });

        if stall {
            body.take(1).chain(stream::pending()).boxed()
        } else {
            body.boxed()
        }
    }
}

#[async_trait]
impl TransferDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, _res: &ResourceDescriptor) -> bool {
        true
    }

    async fn probe(&self, _res: &ResourceDescriptor, _ctx: &DriverContext) -> DownloadResult<ProbeInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeInfo {
            total_size: self.report_size.then_some(self.data.len() as u64),
            supports_ranges: self.supports_ranges,
        })
    }

    async fn open_range(&self, _res: &ResourceDescriptor, _ctx: &DriverContext, start: u64) -> DownloadResult<ByteStream> {
        let n = self.range_opens.fetch_add(1, Ordering::SeqCst);
        self.hang_if_asked().await;
        let periodic = self.fail_every.is_some_and(|k| (n + 1) % k == 0);
        if n < self.failing_ranges || periodic {
            return Err(DownloadError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        }
        let stall = self.probes.load(Ordering::SeqCst) <= self.stall_attempts;
        Ok(self.body(start as usize, self.max_response, stall))
    }

    async fn open_full(&self, _res: &ResourceDescriptor, _ctx: &DriverContext) -> DownloadResult<ByteStream> {
        self.full_opens.fetch_add(1, Ordering::SeqCst);
        self.hang_if_asked().await;
        Ok(self.body(0, None, false))
    }
}

/// Memory sink that remembers every write since the last reset.
#[derive(Default)]
pub struct RecordingSink {
    inner: MemorySink,
    writes: Mutex<Vec<(u64, u64)>>,
}

impl RecordingSink {
    pub fn contents(&self) -> Vec<u8> {
        self.inner.contents()
    }

    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.writes.lock().clone()
    }

    /// Panics if any two writes since the last reset overlap.
    pub fn assert_no_overlap(&self) {
        let mut w = self.writes();
        w.sort();
        for pair in w.windows(2) {
            let (a_off, a_len) = pair[0];
            let (b_off, _) = pair[1];
            assert!(a_off + a_len <= b_off, "overlapping writes: {:?} and {:?}", pair[0], pair[1]);
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn set_len(&self, len: u64) -> io::Result<()> {
        if len == 0 {
            self.writes.lock().clear();
        }
        self.inner.set_len(len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.writes.lock().push((offset, data.len() as u64));
        self.inner.write_at(offset, data).await
    }

    async fn len(&self) -> io::Result<u64> {
        self.inner.len().await
    }
}

/// Sink whose writes always fail.
#[derive(Default)]
pub struct BrokenSink;

#[async_trait]
impl Sink for BrokenSink {
    async fn set_len(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::other("disk full"))
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(0)
    }
}

/// Sink whose writes never complete, like a wedged disk.
#[derive(Default)]
pub struct StuckSink;

#[async_trait]
impl Sink for StuckSink {
    async fn set_len(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        std::future::pending().await
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(0)
    }
}
