//! Single-resource downloader.
//!
//! One call to [`Downloader::download`] runs up to `max_try` attempts. Each
//! attempt probes the resource and then either splits it across a pool of
//! ranged connections or copies it over one plain GET.
//!
//! ```text
//! attempt ──► probe ──► ranged? ──yes──► RangeMap + worker pool + stall monitor
//!                          │
//!                          └──no───► sequential copy
//! ```

use crate::core::assembler::Sink;
use crate::core::config::DownloadConfig;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::events::EngineEvent;
use crate::core::model::{DownloadOutcome, ItemStatus, ProbeInfo, ResourceDescriptor, TransferMode};
use crate::core::progress::{ProgressReporter, ProgressTarget, DEFAULT_REPORT_INTERVAL};
use crate::core::range_map::{RangeMap, Segment};
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::core::stall::StallMonitor;
use crate::plugins::registry::{DriverContext, TransferDriver};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Downloader {
    driver: Arc<dyn TransferDriver>,
    ctx: DriverContext,
    config: DownloadConfig,
    progress: Option<ProgressTarget>,
}

impl Downloader {
    pub fn new(driver: Arc<dyn TransferDriver>, ctx: DriverContext, config: DownloadConfig) -> Self {
        Self { driver, ctx, config, progress: None }
    }

    pub fn with_progress(mut self, target: ProgressTarget) -> Self {
        self.progress = Some(target);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download `res` into `sink`, retrying whole attempts on transient
    /// failures. `cancel` aborts everything and is never retried.
    pub async fn download(
        &self,
        res: &ResourceDescriptor,
        sink: Arc<dyn Sink>,
        cancel: &CancellationToken,
    ) -> DownloadResult<DownloadOutcome> {
        let policy = RetryPolicy { max_tries: self.config.max_try, interval: self.config.retry_interval };
        retry_with_backoff(
            policy,
            cancel,
            move |_| self.attempt(res, Arc::clone(&sink), cancel),
            |err, next| {
                if let Some(p) = &self.progress {
                    let _ = p.tx.send(EngineEvent::ItemStatusChanged { item_id: p.item_id, status: ItemStatus::Retrying });
                    let _ = p.tx.send(EngineEvent::Info {
                        scope: format!("retry item={}", p.item_id),
                        message: format!("attempt {} failed: {}", next, err),
                    });
                }
            },
        )
        .await
    }

    /// One attempt: reset the destination, probe, transfer.
    pub async fn attempt(
        &self,
        res: &ResourceDescriptor,
        sink: Arc<dyn Sink>,
        cancel: &CancellationToken,
    ) -> DownloadResult<DownloadOutcome> {
        sink.set_len(0).await?;

        let probe = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            r = self.driver.probe(res, &self.ctx) => r?,
        };
        info!(uri = %res.uri, size = ?probe.total_size, ranges = probe.supports_ranges, "probed resource");

        match probe.ranged_size() {
            Some(total) => self.download_ranged(res, sink, total, probe, cancel).await,
            None => self.download_sequential(res, sink, probe, cancel).await,
        }
    }

    async fn download_ranged(
        &self,
        res: &ResourceDescriptor,
        sink: Arc<dyn Sink>,
        total: u64,
        probe: ProbeInfo,
        cancel: &CancellationToken,
    ) -> DownloadResult<DownloadOutcome> {
        sink.set_len(total).await?;

        let attempt_cancel = cancel.child_token();
        let transferred = Arc::new(AtomicU64::new(0));
        let pool = Arc::new(WorkerPool {
            driver: Arc::clone(&self.driver),
            ctx: self.ctx.clone(),
            res: res.clone(),
            sink: Arc::clone(&sink),
            map: RangeMap::new(total, self.config.fragments()),
            transferred: Arc::clone(&transferred),
            buffer_size: self.config.buffer(),
            read_timeout: self.config.timeout,
            cancel: attempt_cancel.clone(),
            no_more_gaps: CancellationToken::new(),
            last_error: Mutex::new(None),
            faults_since_progress: AtomicUsize::new(0),
        });

        let monitor = self
            .config
            .timeout
            .map(|t| StallMonitor::spawn(Arc::clone(&transferred), t, self.config.monitor_tick, attempt_cancel.clone()));
        let reporter = self
            .progress
            .clone()
            .map(|t| ProgressReporter::start(t, Arc::clone(&transferred), Some(total), DEFAULT_REPORT_INTERVAL));

        self.run_pool(&pool).await;

        let stalled = match monitor {
            Some(m) => m.stop().await,
            None => false,
        };
        let finished = pool.map.is_all_finished();
        if let Some(r) = reporter {
            r.finish(finished).await;
        }

        if !finished {
            let remaining = pool.map.unfinished_total();
            let err = match pool.last_error.lock().take() {
                Some(e) if !e.is_cancellation() => e,
                _ if stalled => DownloadError::Stalled(self.config.timeout.unwrap_or_default()),
                _ if cancel.is_cancelled() => DownloadError::Cancelled,
                Some(e) => e,
                None => DownloadError::Incomplete { remaining, total },
            };
            warn!(uri = %res.uri, remaining, total, error = %err, "ranged attempt failed");
            return Err(err);
        }

        sink.flush().await?;
        let bytes = pool.map.finished_total();
        info!(uri = %res.uri, bytes, "ranged download complete");
        Ok(DownloadOutcome { bytes_transferred: bytes, complete: true, probe, mode: TransferMode::Ranged })
    }

    /// Submit workers until the file is covered, then wait for all of them.
    async fn run_pool(&self, pool: &Arc<WorkerPool>) {
        let slots = Arc::new(Semaphore::new(self.config.threads()));
        let mut workers = JoinSet::new();
        let fault_limit = self.config.max_worker_faults.max(1);

        while !pool.map.is_all_finished() {
            if pool.faults_since_progress.load(Ordering::Relaxed) >= fault_limit {
                if workers.is_empty() {
                    debug!(faults = fault_limit, "workers keep failing without progress, giving up");
                    break;
                }
                // hold new connections until a running worker ends
                tokio::select! {
                    Some(joined) = workers.join_next() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "worker task panicked");
                        }
                    }
                    _ = pool.no_more_gaps.cancelled() => break,
                    _ = pool.cancel.cancelled() => break,
                }
                continue;
            }

            let permit = tokio::select! {
                p = Arc::clone(&slots).acquire_owned() => p,
                _ = pool.no_more_gaps.cancelled() => break,
                _ = pool.cancel.cancelled() => break,
            };
            let Ok(permit) = permit else { break };
            if pool.map.is_all_finished() {
                break;
            }

            let worker = Arc::clone(pool);
            workers.spawn(async move {
                let _permit = permit;
                worker.run_worker().await;
            });
            while let Some(Some(joined)) = workers.join_next().now_or_never() {
                if let Err(e) = joined {
                    warn!(error = %e, "worker task panicked");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.additional_connection_interval) => {}
                _ = pool.no_more_gaps.cancelled() => break,
                _ = pool.cancel.cancelled() => break,
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task panicked");
            }
        }
    }

    async fn download_sequential(
        &self,
        res: &ResourceDescriptor,
        sink: Arc<dyn Sink>,
        probe: ProbeInfo,
        cancel: &CancellationToken,
    ) -> DownloadResult<DownloadOutcome> {
        info!(uri = %res.uri, "server does not support ranges, using a single stream");

        let transferred = Arc::new(AtomicU64::new(0));
        let reporter = self
            .progress
            .clone()
            .map(|t| ProgressReporter::start(t, Arc::clone(&transferred), probe.total_size, DEFAULT_REPORT_INTERVAL));

        let result = self.copy_stream(res, sink.as_ref(), &transferred, cancel).await;
        if let Some(r) = reporter {
            r.finish(result.is_ok()).await;
        }
        let bytes = result?;

        if let Some(total) = probe.total_size {
            if bytes < total {
                return Err(DownloadError::Incomplete { remaining: total - bytes, total });
            }
        }
        Ok(DownloadOutcome { bytes_transferred: bytes, complete: true, probe, mode: TransferMode::Sequential })
    }

    async fn copy_stream(
        &self,
        res: &ResourceDescriptor,
        sink: &dyn Sink,
        transferred: &AtomicU64,
        cancel: &CancellationToken,
    ) -> DownloadResult<u64> {
        let stream = bounded(self.driver.open_full(res, &self.ctx), self.config.timeout, cancel).await?;
        let mut reader = StreamReader::new(stream);
        let mut buf = vec![0u8; self.config.buffer()];
        let mut offset = 0u64;
        loop {
            let n = read_some(&mut reader, &mut buf, self.config.timeout, cancel).await?;
            if n == 0 {
                break;
            }
            let write = async { sink.write_at(offset, &buf[..n]).await.map_err(DownloadError::from) };
            bounded(write, None, cancel).await?;
            offset += n as u64;
            transferred.store(offset, Ordering::Relaxed);
        }
        sink.flush().await?;
        Ok(offset)
    }
}

/// State shared by the workers of one ranged attempt.
struct WorkerPool {
    driver: Arc<dyn TransferDriver>,
    ctx: DriverContext,
    res: ResourceDescriptor,
    sink: Arc<dyn Sink>,
    map: RangeMap,
    transferred: Arc<AtomicU64>,
    buffer_size: usize,
    read_timeout: Option<Duration>,
    cancel: CancellationToken,
    no_more_gaps: CancellationToken,
    last_error: Mutex<Option<DownloadError>>,
    /// Worker faults since the last byte was received.
    faults_since_progress: AtomicUsize,
}

impl WorkerPool {
    async fn run_worker(&self) {
        let seg = match self.map.start_segment(None) {
            Ok(Some(seg)) => seg,
            Ok(None) => {
                // lost a race for the same offset, or there is nothing left
                if self.map.is_all_finished() {
                    self.no_more_gaps.cancel();
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "cannot open segment");
                self.record(e.into());
                self.cancel.cancel();
                return;
            }
        };

        debug!(start = seg.start(), "worker started");
        let result = self.fill(&seg).await;
        self.map.finish_or_cancel(&seg);

        match result {
            Ok(()) => debug!(start = seg.start(), len = ?self.map.length(&seg), "worker done"),
            Err(e) => {
                debug!(start = seg.start(), error = %e, "worker failed");
                if matches!(e, DownloadError::ReadTimeout(_)) {
                    self.cancel.cancel();
                }
                self.record(e);
            }
        }
        if self.map.is_all_finished() {
            self.no_more_gaps.cancel();
        }
    }

    async fn fill(&self, seg: &Segment) -> DownloadResult<()> {
        let open = self.driver.open_range(&self.res, &self.ctx, seg.start());
        let stream = bounded(open, self.read_timeout, &self.cancel).await?;
        let mut reader = StreamReader::new(stream);
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let n = read_some(&mut reader, &mut buf, self.read_timeout, &self.cancel).await?;
            if n == 0 {
                return Ok(());
            }

            let r = self.map.reserve(seg, n as u64)?;
            if r.accepted > 0 {
                let write = async {
                    self.sink.write_at(r.offset, &buf[..r.accepted as usize]).await.map_err(DownloadError::from)
                };
                if let Err(e) = bounded(write, None, &self.cancel).await {
                    // the reserved range is already counted as done
                    self.cancel.cancel();
                    return Err(e);
                }
                self.transferred.fetch_add(r.accepted, Ordering::Relaxed);
                self.faults_since_progress.store(0, Ordering::Relaxed);
            }
            if !r.more {
                return Ok(());
            }
        }
    }

    /// Keep the most informative error: a real fault beats cancellation, and
    /// a fatal one is never replaced.
    fn record(&self, err: DownloadError) {
        if !err.is_cancellation() {
            self.faults_since_progress.fetch_add(1, Ordering::Relaxed);
        }
        let mut slot = self.last_error.lock();
        let keep_previous = match slot.as_ref() {
            Some(prev) => err.is_cancellation() || (!prev.is_retryable() && !prev.is_cancellation()),
            None => false,
        };
        if !keep_previous {
            *slot = Some(err);
        }
    }
}

async fn read_some<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> DownloadResult<usize>
where
    R: AsyncRead + Unpin,
{
    bounded(async { reader.read(buf).await.map_err(DownloadError::from) }, timeout, cancel).await
}

/// Run `fut` until it completes, `timeout` elapses (`ReadTimeout`) or
/// `cancel` fires (`Cancelled`).
async fn bounded<T, F>(fut: F, timeout: Option<Duration>, cancel: &CancellationToken) -> DownloadResult<T>
where
    F: Future<Output = DownloadResult<T>>,
{
    let timed = async {
        match timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| DownloadError::ReadTimeout(t))?,
            None => fut.await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        r = timed => r,
    }
}
