use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Random-access destination shared by every worker of an attempt.
///
/// Implementations serialize `write_at` internally; callers only guarantee
/// that concurrent writes never overlap.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn set_len(&self, len: u64) -> io::Result<()>;
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    async fn len(&self) -> io::Result<u64>;

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed sink. One lock guards "seek + write".
pub struct Assembler {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl Assembler {
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .await?;

        Ok(Self { path: path.to_path_buf(), file: tokio::sync::Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for Assembler {
    async fn set_len(&self, len: u64) -> io::Result<()> {
        // sparse where the filesystem allows it
        let f = self.file.lock().await;
        f.set_len(len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut f = self.file.lock().await;
        f.seek(io::SeekFrom::Start(offset)).await?;
        f.write_all(data).await
    }

    async fn len(&self) -> io::Result<u64> {
        let f = self.file.lock().await;
        Ok(f.metadata().await?.len())
    }

    async fn flush(&self) -> io::Result<()> {
        let mut f = self.file.lock().await;
        f.flush().await?;
        f.sync_data().await
    }
}

/// In-memory sink, mostly for tests and small payloads.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn set_len(&self, len: u64) -> io::Result<()> {
        self.buf.lock().resize(len as usize, 0);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut buf = self.buf.lock();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(self.buf.lock().len() as u64)
    }
}
