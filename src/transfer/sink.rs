//! Destinations for received bytes.
//!
//! Every incoming transfer writes into a [`TransferSink`]. The sink starts
//! in buffered mode, accumulating chunks in memory, and can be upgraded
//! once to a streaming writer obtained from a [`StreamFactory`]. The
//! upgrade drains the buffered prefix into the writer before any newer
//! chunk, so the destination always sees bytes in arrival order.
//!
//! Fallback is only safe while no byte has reached the external writer:
//! an acquire or drain failure leaves the sink buffered with nothing lost,
//! and a failed first write falls back the same way. A write failure after
//! a streamed prefix is retried once and then fatal, because the buffered
//! side cannot recreate bytes the writer already consumed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::SendlinkError;
use crate::transfer::protocol::FileMetadata;

/// Where a completed transfer's bytes ended up.
#[derive(Debug, Clone)]
pub enum ArtifactData {
    Buffered(Bytes),
    File(PathBuf),
}

/// One completed transfer, ready for retrieval or export.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: ArtifactData,
}

impl Artifact {
    /// The full content, loading from disk when the sink streamed.
    pub async fn bytes(&self) -> std::io::Result<Bytes> {
        match &self.data {
            ArtifactData::Buffered(bytes) => Ok(bytes.clone()),
            ArtifactData::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

/// An open streaming destination for one transfer.
#[async_trait]
pub trait StreamWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush and close, yielding where the bytes ended up.
    async fn finish(self: Box<Self>) -> Result<ArtifactData>;

    /// Discard the destination. Best effort; errors are swallowed.
    async fn abandon(self: Box<Self>);
}

/// Provider of streaming destinations.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn acquire(&self, meta: &FileMetadata) -> Result<Box<dyn StreamWriter>>;
}

enum SinkState {
    Buffered(BytesMut),
    Streaming(Box<dyn StreamWriter>),
}

/// Per-transfer write destination with one-shot streaming upgrade.
pub struct TransferSink {
    meta: FileMetadata,
    state: SinkState,
    /// Bytes successfully handed to the streaming writer. Fallback to
    /// buffering is only permitted while this is zero.
    streamed: u64,
}

impl TransferSink {
    pub fn new(meta: FileMetadata) -> Self {
        let capacity = usize::try_from(meta.filesize).unwrap_or(0).min(1 << 20);
        Self {
            meta,
            state: SinkState::Buffered(BytesMut::with_capacity(capacity)),
            streamed: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, SinkState::Streaming(_))
    }

    /// Try to switch to a streaming destination. Any buffered prefix is
    /// drained into the writer first. On failure the sink stays buffered
    /// with its contents intact.
    pub async fn upgrade(&mut self, factory: &dyn StreamFactory) -> bool {
        let SinkState::Buffered(buffer) = &self.state else {
            return true;
        };

        let mut writer = match factory.acquire(&self.meta).await {
            Ok(writer) => writer,
            Err(e) => {
                warn!(
                    id = %self.meta.id,
                    "Streaming destination unavailable, buffering: {e:#}"
                );
                return false;
            }
        };

        if !buffer.is_empty() {
            if let Err(e) = writer.write(buffer).await {
                warn!(
                    id = %self.meta.id,
                    "Failed to drain buffered prefix, staying buffered: {e:#}"
                );
                writer.abandon().await;
                return false;
            }
        }

        let drained = buffer.len() as u64;
        self.streamed = drained;
        self.state = SinkState::Streaming(writer);
        debug!(id = %self.meta.id, drained_bytes = drained, "Sink upgraded to streaming");
        true
    }

    /// Append one chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SendlinkError> {
        match &mut self.state {
            SinkState::Buffered(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            SinkState::Streaming(writer) => {
                match writer.write(chunk).await {
                    Ok(()) => {
                        self.streamed += chunk.len() as u64;
                        Ok(())
                    }
                    Err(first) if self.streamed == 0 => {
                        // nothing reached the destination yet, so buffering
                        // this chunk loses no data
                        warn!(
                            id = %self.meta.id,
                            "First streaming write failed, falling back to buffering: {first:#}"
                        );
                        let mut buffer = BytesMut::with_capacity(chunk.len());
                        buffer.extend_from_slice(chunk);
                        let old =
                            std::mem::replace(&mut self.state, SinkState::Buffered(buffer));
                        if let SinkState::Streaming(writer) = old {
                            writer.abandon().await;
                        }
                        Ok(())
                    }
                    Err(first) => {
                        warn!(id = %self.meta.id, "Streaming write failed, retrying once: {first:#}");
                        match writer.write(chunk).await {
                            Ok(()) => {
                                self.streamed += chunk.len() as u64;
                                Ok(())
                            }
                            Err(second) => Err(SendlinkError::SinkWrite(format!(
                                "transfer {}: {second:#}",
                                self.meta.id
                            ))),
                        }
                    }
                }
            }
        }
    }

    /// Seal the sink into an artifact. Consumes the sink; a transfer
    /// finalizes exactly once.
    pub async fn finalize(self) -> Result<Artifact, SendlinkError> {
        let data = match self.state {
            SinkState::Buffered(buffer) => ArtifactData::Buffered(buffer.freeze()),
            SinkState::Streaming(writer) => writer
                .finish()
                .await
                .map_err(|e| SendlinkError::SinkWrite(format!("transfer {}: {e:#}", self.meta.id)))?,
        };
        Ok(Artifact {
            id: self.meta.id,
            name: self.meta.filename,
            mime_type: self.meta.filetype,
            size: self.meta.filesize,
            data,
        })
    }

    /// Drop the sink without producing an artifact, releasing any
    /// streaming destination it held.
    pub async fn abandon(self) {
        if let SinkState::Streaming(writer) = self.state {
            writer.abandon().await;
        }
    }
}

/// Streams incoming files into a directory, one file per transfer.
pub struct DirStreamFactory {
    dir: PathBuf,
}

impl DirStreamFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Reject names that would escape the destination directory.
fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Empty filename");
    }
    if name.contains('/') || name.contains('\\') {
        anyhow::bail!("Filename contains path separator: {name}");
    }
    if name == "." || name == ".." {
        anyhow::bail!("Filename is a directory reference: {name}");
    }
    if name.contains('\0') {
        anyhow::bail!("Filename contains NUL byte");
    }
    Ok(())
}

#[async_trait]
impl StreamFactory for DirStreamFactory {
    async fn acquire(&self, meta: &FileMetadata) -> Result<Box<dyn StreamWriter>> {
        validate_filename(&meta.filename)
            .with_context(|| format!("Rejected filename for transfer {}", meta.id))?;
        // per-transfer prefix keeps concurrent same-named files apart
        let path = self.dir.join(format!("{}_{}", meta.id, meta.filename));
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Box::new(FileStreamWriter { file, path }))
    }
}

struct FileStreamWriter {
    file: tokio::fs::File,
    path: PathBuf,
}

#[async_trait]
impl StreamWriter for FileStreamWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .await
            .with_context(|| format!("Write failed: {}", self.path.display()))
    }

    async fn finish(mut self: Box<Self>) -> Result<ArtifactData> {
        self.file
            .flush()
            .await
            .with_context(|| format!("Flush failed: {}", self.path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("Sync failed: {}", self.path.display()))?;
        Ok(ArtifactData::File(self.path))
    }

    async fn abandon(self: Box<Self>) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!("Failed to remove abandoned file {}: {e}", self.path.display());
        }
    }
}
