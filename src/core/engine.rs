use crate::core::assembler::Assembler;
use crate::core::config::DownloadConfig;
use crate::core::downloader::Downloader;
use crate::core::events::EngineEvent;
use crate::core::model::*;
use crate::core::progress::ProgressTarget;
use crate::plugins::registry::{DriverContext, PluginRegistry, ResolveContext};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Runs batches of links one item at a time. Each item goes through the
/// parallel [`Downloader`] into `<target>.partial`, renamed on success.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<PluginRegistry>,
    out_dir: PathBuf,
    config: DownloadConfig,
    driver_ctx: DriverContext,
    event_tx: broadcast::Sender<EngineEvent>,
    jobs: Arc<Mutex<HashMap<JobId, JobStatus>>>,
    job_notifies: Arc<Mutex<HashMap<JobId, Arc<Notify>>>>,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn new(
        registry: PluginRegistry,
        out_dir: PathBuf,
        config: DownloadConfig,
        driver_ctx: DriverContext,
    ) -> anyhow::Result<Self> {
        let (event_tx, _) = broadcast::channel(256);

        tokio::fs::create_dir_all(&out_dir).await
            .with_context(|| format!("create out_dir {}", out_dir.display()))?;

        Ok(Self {
            registry: Arc::new(registry),
            out_dir,
            config,
            driver_ctx,
            event_tx,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            job_notifies: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Abort every running and queued item.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn add_and_start(&self, inputs: Vec<LinkInput>) -> anyhow::Result<JobId> {
        let job_id = Uuid::new_v4();
        self.set_job_status(job_id, JobStatus::Pending).await;

        let notify = Arc::new(Notify::new());
        self.job_notifies.lock().await.insert(job_id, notify.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_job(job_id, inputs, notify).await;
        });

        Ok(job_id)
    }

    /// Wait until `job_id` reaches a final state and return it.
    pub async fn wait_job(&self, job_id: JobId) -> Option<JobStatus> {
        let notify = self.job_notifies.lock().await.get(&job_id).cloned();
        if let Some(n) = notify {
            let notified = n.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // the job may have finished between the lookup and enable()
            if !self.is_job_finished(job_id).await {
                notified.await;
            }
        }
        self.jobs.lock().await.get(&job_id).copied()
    }

    pub async fn is_job_finished(&self, job_id: JobId) -> bool {
        let jobs = self.jobs.lock().await;
        matches!(jobs.get(&job_id), Some(JobStatus::Completed | JobStatus::Failed))
    }

    async fn set_job_status(&self, job_id: JobId, status: JobStatus) {
        self.jobs.lock().await.insert(job_id, status);
        let _ = self.event_tx.send(EngineEvent::JobStatusChanged { job_id, status });
    }

    async fn run_job(&self, job_id: JobId, inputs: Vec<LinkInput>, notify: Arc<Notify>) {
        self.set_job_status(job_id, JobStatus::Running).await;

        let ctx = ResolveContext { out_dir: self.out_dir.clone() };
        let mut items: Vec<DownloadItem> = vec![];
        let mut any_failed = false;

        for input in inputs {
            let resolver = match self.registry.best_resolver(&input) {
                Some(r) => r,
                None => {
                    any_failed = true;
                    let _ = self.event_tx.send(EngineEvent::Error {
                        scope: "resolve".to_string(),
                        message: format!("no resolver for input: {}", input.raw),
                    });
                    continue;
                }
            };

            match resolver.resolve(&input, &ctx) {
                Ok(d) => {
                    let item = DownloadItem {
                        id: Uuid::new_v4(),
                        job_id,
                        status: ItemStatus::Ready,
                        display_name: d.display_name,
                        target_path: d.suggested_path,
                        resource: d.resource,
                    };
                    let _ = self.event_tx.send(EngineEvent::ItemAdded {
                        item_id: item.id,
                        display_name: item.display_name.clone(),
                        target_path: item.target_path.clone(),
                        uri: item.resource.uri.clone(),
                    });
                    items.push(item);
                }
                Err(e) => {
                    any_failed = true;
                    let _ = self.event_tx.send(EngineEvent::Error {
                        scope: format!("resolve({})", resolver.name()),
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        for mut item in items {
            if self.cancel.is_cancelled() {
                any_failed = true;
                self.set_item_status(&mut item, ItemStatus::Failed);
                continue;
            }
            match self.download_item(&mut item).await {
                Ok(outcome) => {
                    info!(item = %item.display_name, bytes = outcome.bytes_transferred, mode = ?outcome.mode, "item done");
                    self.set_item_status(&mut item, ItemStatus::Done);
                }
                Err(e) => {
                    any_failed = true;
                    error!(item = %item.display_name, error = %format!("{:#}", e), "item failed");
                    let _ = self.event_tx.send(EngineEvent::Error {
                        scope: format!("item({})", item.display_name),
                        message: format!("{:#}", e),
                    });
                    self.set_item_status(&mut item, ItemStatus::Failed);
                }
            }
        }

        let status = if any_failed { JobStatus::Failed } else { JobStatus::Completed };
        self.set_job_status(job_id, status).await;
        self.job_notifies.lock().await.remove(&job_id);
        notify.notify_waiters();
    }

    fn set_item_status(&self, item: &mut DownloadItem, status: ItemStatus) {
        item.status = status;
        let _ = self.event_tx.send(EngineEvent::ItemStatusChanged { item_id: item.id, status });
    }

    async fn download_item(&self, item: &mut DownloadItem) -> anyhow::Result<DownloadOutcome> {
        self.set_item_status(item, ItemStatus::Downloading);

        let driver = self.registry.driver_for(&item.resource).context("no driver for resource")?;
        let _ = self.event_tx.send(EngineEvent::Info {
            scope: format!("driver item={}", item.display_name),
            message: format!("selected driver={}", driver.name()),
        });

        let partial_path = partial_path_for(&item.target_path);
        let assembler = Arc::new(Assembler::create(&partial_path).await
            .with_context(|| format!("create {}", partial_path.display()))?);

        let target = ProgressTarget {
            tx: self.event_tx.clone(),
            item_id: item.id,
            label: item.display_name.clone(),
        };
        let downloader = Downloader::new(driver, self.driver_ctx.clone(), self.config.clone()).with_progress(target);

        let outcome = match downloader.download(&item.resource, assembler.clone(), &self.cancel).await {
            Ok(o) => o,
            Err(e) => {
                drop(assembler);
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(e).with_context(|| format!("download {}", item.resource.uri));
            }
        };
        drop(assembler);

        if tokio::fs::metadata(&item.target_path).await.is_ok() {
            let _ = tokio::fs::remove_file(&item.target_path).await;
        }
        tokio::fs::rename(&partial_path, &item.target_path).await
            .with_context(|| format!("rename {} -> {}", partial_path.display(), item.target_path.display()))?;

        Ok(outcome)
    }
}

/// `dir/name.ext` -> `dir/name.ext.partial`
pub fn partial_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}
