use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

pub type JobId = Uuid;
pub type ItemId = Uuid;

#[derive(Debug, Clone)]
pub struct LinkInput {
    pub raw: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Ready,
    Downloading,
    Retrying,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub id: ItemId,
    pub job_id: JobId,
    pub status: ItemStatus,
    pub display_name: String,
    pub target_path: PathBuf,
    pub resource: ResourceDescriptor,
}

#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub headers: HashMap<String, String>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), headers: HashMap::new() }
    }
}

/// What a metadata-only request told us about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeInfo {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
}

impl ProbeInfo {
    /// Size to split by, if the server lets us split at all.
    pub fn ranged_size(&self) -> Option<u64> {
        if self.supports_ranges {
            self.total_size
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Ranged,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes_transferred: u64,
    pub complete: bool,
    pub probe: ProbeInfo,
    pub mode: TransferMode,
}
