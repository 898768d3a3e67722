//! Aggregate-progress watchdog.
//!
//! Per-read timeouts catch a single dead connection. The stall monitor
//! catches the case where reads keep "succeeding" somewhere but the total
//! byte count stops moving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct StallMonitor {
    handle: JoinHandle<bool>,
    stop: CancellationToken,
}

impl StallMonitor {
    /// Watch `transferred` and cancel `cancel` once it has not changed for
    /// longer than `timeout`.
    pub fn spawn(transferred: Arc<AtomicU64>, timeout: Duration, tick: Duration, cancel: CancellationToken) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(watch(transferred, timeout, tick, cancel, stop.clone()));
        Self { handle, stop }
    }

    /// Stop watching. Returns whether the monitor fired.
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        self.handle.await.unwrap_or(false)
    }
}

async fn watch(
    transferred: Arc<AtomicU64>,
    timeout: Duration,
    tick: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_seen = transferred.load(Ordering::Relaxed);
    let mut last_change = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        let now = transferred.load(Ordering::Relaxed);
        if now != last_seen {
            last_seen = now;
            last_change = Instant::now();
            continue;
        }
        if last_change.elapsed() > timeout {
            warn!(bytes = now, ?timeout, "no progress, cancelling transfer");
            cancel.cancel();
            return true;
        }
        debug!(bytes = now, idle = ?last_change.elapsed(), "stall monitor tick");
    }
}
