use crate::core::events::EngineEvent;
use crate::core::model::ItemId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// Where progress for one item goes. Purely observational: a full or
/// receiver-less channel never slows the transfer down.
#[derive(Debug, Clone)]
pub struct ProgressTarget {
    pub tx: broadcast::Sender<EngineEvent>,
    pub item_id: ItemId,
    pub label: String,
}

impl ProgressTarget {
    fn send(&self, downloaded: u64, total: Option<u64>, finished: bool, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64().max(0.001);
        let speed = (downloaded as f64 / elapsed) as u64;
        let eta = match (total, speed) {
            (Some(t), s) if s > 0 && downloaded < t => Some(Duration::from_secs_f64(((t - downloaded) as f64) / (s as f64))),
            _ => None,
        };

        let _ = self.tx.send(EngineEvent::Progress {
            item_id: self.item_id,
            label: self.label.clone(),
            downloaded,
            total,
            finished,
            speed_bps: speed,
            eta,
        });
    }
}

/// Background task that samples a byte counter and publishes it.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
    stop: CancellationToken,
    target: ProgressTarget,
    transferred: Arc<AtomicU64>,
    total: Option<u64>,
    started: Instant,
}

impl ProgressReporter {
    pub fn start(target: ProgressTarget, transferred: Arc<AtomicU64>, total: Option<u64>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let started = Instant::now();

        let handle = {
            let target = target.clone();
            let transferred = Arc::clone(&transferred);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    target.send(transferred.load(Ordering::Relaxed), total, false, started);
                }
            })
        };

        Self { handle, stop, target, transferred, total, started }
    }

    /// Stop sampling and publish the final count.
    pub async fn finish(self, finished: bool) {
        self.stop.cancel();
        let _ = self.handle.await;
        self.target.send(self.transferred.load(Ordering::Relaxed), self.total, finished, self.started);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn reports_and_ends_with_finished_flag() {
        let (tx, mut rx) = broadcast::channel(64);
        let item_id = Uuid::new_v4();
        let counter = Arc::new(AtomicU64::new(0));
        let target = ProgressTarget { tx, item_id, label: "file.bin".to_string() };

        let reporter = ProgressReporter::start(target, counter.clone(), Some(100), Duration::from_millis(5));
        counter.store(40, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        counter.store(100, Ordering::Relaxed);
        reporter.finish(true).await;

        let mut last = None;
        while let Ok(evt) = rx.try_recv() {
            last = Some(evt);
        }
        match last {
            Some(EngineEvent::Progress { item_id: id, label, downloaded, total, finished, eta, .. }) => {
                assert_eq!(id, item_id);
                assert_eq!(label, "file.bin");
                assert_eq!(downloaded, 100);
                assert_eq!(total, Some(100));
                assert!(finished);
                assert_eq!(eta, None);
            }
            other => panic!("unexpected last event: {:?}", other),
        }
    }
}
