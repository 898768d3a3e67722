use async_trait::async_trait;
use crate::core::config::DownloadConfig;
use crate::core::error::DownloadResult;
use crate::core::model::{LinkInput, ProbeInfo, ResourceDescriptor};
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Body of a transfer, chunk by chunk as the transport delivers it.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug)]
pub struct ResolveContext {
    pub out_dir: PathBuf,
}

#[derive(Debug)]
pub struct DownloadItemDraft {
    pub display_name: String,
    pub suggested_path: PathBuf,
    pub resource: ResourceDescriptor,
}

pub trait LinkResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, input: &LinkInput) -> u8;
    fn resolve(&self, input: &LinkInput, ctx: &ResolveContext) -> anyhow::Result<DownloadItemDraft>;
}

#[derive(Debug, Clone)]
pub struct DownloadCliConfig {
    pub headers: HashMap<String, String>,
    pub driver_ctx: DriverContext,
    pub download: DownloadConfig,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_download_command(&self, cmd: Command) -> Command;
    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    /// Bound on metadata requests. Body reads are bounded by the downloader.
    pub timeout_secs: u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self { user_agent: concat!("orange-rangefetch/", env!("CARGO_PKG_VERSION")).to_string(), timeout_secs: 60 }
    }
}

/// Transport used by the downloader. `open_range` is open-ended: the server
/// may send anything from one byte up to the rest of the resource.
#[async_trait]
pub trait TransferDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, res: &ResourceDescriptor) -> bool;

    async fn probe(&self, res: &ResourceDescriptor, ctx: &DriverContext) -> DownloadResult<ProbeInfo>;

    async fn open_range(&self, res: &ResourceDescriptor, ctx: &DriverContext, start: u64) -> DownloadResult<ByteStream>;

    async fn open_full(&self, res: &ResourceDescriptor, ctx: &DriverContext) -> DownloadResult<ByteStream>;
}

pub struct PluginRegistry {
    resolvers: Vec<Box<dyn LinkResolver>>,
    drivers: Vec<Arc<dyn TransferDriver>>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self { resolvers: vec![], drivers: vec![], cli_plugins: vec![] }
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        let mut reg = Self::empty();
        reg.register_resolver(Box::new(crate::plugins::http::resolver::HttpResolver::new()));
        reg.register_driver(Arc::new(crate::plugins::http::driver::HttpDriver::new()?));
        reg.register_cli(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        Ok(reg)
    }

    pub fn register_resolver(&mut self, r: Box<dyn LinkResolver>) {
        self.resolvers.push(r);
    }

    pub fn register_driver(&mut self, d: Arc<dyn TransferDriver>) {
        self.drivers.push(d);
    }

    pub fn register_cli(&mut self, p: Box<dyn CliPlugin>) {
        self.cli_plugins.push(p);
    }

    pub fn augment_download_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_download_command(c))
    }

    pub fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_download_matches(matches, cfg)?;
        }
        Ok(())
    }

    pub fn best_resolver(&self, input: &LinkInput) -> Option<&dyn LinkResolver> {
        self.resolvers
            .iter()
            .map(|r| (r.can_handle(input), r.as_ref()))
            .max_by_key(|(c, _)| *c)
            .and_then(|(c, r)| if c == 0 { None } else { Some(r) })
    }

    pub fn driver_for(&self, res: &ResourceDescriptor) -> Option<Arc<dyn TransferDriver>> {
        self.drivers.iter().find(|d| d.supports(res)).cloned()
    }
}
