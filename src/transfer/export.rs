//! Batch export of completed transfers.
//!
//! The receiver deposits every completed transfer into an [`ArtifactSet`];
//! export snapshots that set and hands it to a [`Bundler`], which folds the
//! artifacts into one downloadable byte blob. Export is all-or-nothing: if
//! any entry cannot be read, no bundle is produced and the artifacts stay
//! untouched for a retry.
//!
//! The built-in [`StoreBundler`] writes an uncompressed length-prefixed
//! container. Anything fancier (zip, tar, encryption) plugs in behind the
//! same trait.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::info;

use crate::error::SendlinkError;
use crate::transfer::sink::Artifact;

/// When the artifact set is considered ready to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportPolicy {
    /// Every announced transfer must have reached a terminal state, with
    /// at least one completed.
    #[default]
    AllTerminal,
    /// Export whatever has completed so far, even mid-receive.
    Incremental,
}

struct SetInner {
    completed: Vec<Artifact>,
    /// Transfers announced but not yet terminal.
    pending: usize,
}

/// Thread-safe ledger of completed transfers plus an in-flight count.
///
/// Abandoned and failed transfers only decrement the in-flight count;
/// their partial data never enters the set.
pub struct ArtifactSet {
    inner: Mutex<SetInner>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetInner {
                completed: Vec::new(),
                pending: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce a new in-flight transfer.
    pub fn begin(&self) {
        self.lock().pending += 1;
    }

    /// Move one in-flight transfer to completed.
    pub fn complete(&self, artifact: Artifact) {
        let mut inner = self.lock();
        inner.pending = inner.pending.saturating_sub(1);
        inner.completed.push(artifact);
    }

    /// Retire one in-flight transfer without an artifact.
    pub fn fail(&self) {
        let mut inner = self.lock();
        inner.pending = inner.pending.saturating_sub(1);
    }

    /// Snapshot of everything completed so far, in completion order.
    pub fn completed(&self) -> Vec<Artifact> {
        self.lock().completed.clone()
    }

    /// Transfers announced but not yet terminal.
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    fn snapshot(&self) -> (Vec<Artifact>, usize) {
        let inner = self.lock();
        (inner.completed.clone(), inner.pending)
    }
}

impl Default for ArtifactSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a set of artifacts into one exportable blob.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, artifacts: &[Artifact]) -> Result<Bytes, SendlinkError>;
}

const BUNDLE_MAGIC: &[u8; 4] = b"SLB1";

/// Uncompressed store-format bundler.
///
/// Layout: `"SLB1" | count:u32 |` then per entry
/// `name_len:u16 | name | mime_len:u16 | mime | data_len:u64 | data`.
/// All integers big-endian.
pub struct StoreBundler;

#[async_trait]
impl Bundler for StoreBundler {
    async fn bundle(&self, artifacts: &[Artifact]) -> Result<Bytes, SendlinkError> {
        let count = u32::try_from(artifacts.len())
            .map_err(|_| SendlinkError::Export("too many artifacts for one bundle".to_string()))?;
        let mut buf = BytesMut::new();
        buf.put_slice(BUNDLE_MAGIC);
        buf.put_u32(count);
        for artifact in artifacts {
            let data = artifact.bytes().await.map_err(|e| {
                SendlinkError::Export(format!("failed to read artifact {}: {e}", artifact.name))
            })?;
            let name = artifact.name.as_bytes();
            let mime = artifact.mime_type.as_bytes();
            if name.len() > u16::MAX as usize || mime.len() > u16::MAX as usize {
                return Err(SendlinkError::Export(format!(
                    "artifact {} has an oversized name or mime type",
                    artifact.id
                )));
            }
            buf.put_u16(name.len() as u16);
            buf.put_slice(name);
            buf.put_u16(mime.len() as u16);
            buf.put_slice(mime);
            buf.put_u64(data.len() as u64);
            buf.put_slice(&data);
        }
        Ok(buf.freeze())
    }
}

/// One decoded bundle entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Parse a [`StoreBundler`] blob back into entries.
pub fn decode_bundle(mut bundle: Bytes) -> Result<Vec<BundleEntry>> {
    if bundle.remaining() < 8 {
        anyhow::bail!("Bundle too short for header");
    }
    let mut magic = [0u8; 4];
    bundle.copy_to_slice(&mut magic);
    if &magic != BUNDLE_MAGIC {
        anyhow::bail!("Bad bundle magic: {magic:?}");
    }
    let count = bundle.get_u32() as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let mut take_str = |what: &str, bundle: &mut Bytes| -> Result<String> {
            if bundle.remaining() < 2 {
                anyhow::bail!("Bundle truncated in entry {i} {what} length");
            }
            let len = bundle.get_u16() as usize;
            if bundle.remaining() < len {
                anyhow::bail!("Bundle truncated in entry {i} {what}");
            }
            Ok(String::from_utf8(bundle.copy_to_bytes(len).to_vec())?)
        };
        let name = take_str("name", &mut bundle)?;
        let mime_type = take_str("mime type", &mut bundle)?;
        if bundle.remaining() < 8 {
            anyhow::bail!("Bundle truncated in entry {i} data length");
        }
        let len = usize::try_from(bundle.get_u64())?;
        if bundle.remaining() < len {
            anyhow::bail!("Bundle truncated in entry {i} data");
        }
        let data = bundle.copy_to_bytes(len);
        entries.push(BundleEntry {
            name,
            mime_type,
            data,
        });
    }
    Ok(entries)
}

/// Applies an [`ExportPolicy`] to an [`ArtifactSet`] and runs the bundler.
pub struct Exporter {
    policy: ExportPolicy,
    bundler: Box<dyn Bundler>,
}

impl Exporter {
    pub fn new() -> Self {
        Self {
            policy: ExportPolicy::default(),
            bundler: Box::new(StoreBundler),
        }
    }

    pub fn with(policy: ExportPolicy, bundler: Box<dyn Bundler>) -> Self {
        Self { policy, bundler }
    }

    /// Bundle the set's completed artifacts.
    pub async fn export_all(&self, artifacts: &ArtifactSet) -> Result<Bytes, SendlinkError> {
        let (completed, pending) = artifacts.snapshot();
        if self.policy == ExportPolicy::AllTerminal && pending > 0 {
            return Err(SendlinkError::Export(format!(
                "{pending} transfer(s) still in flight"
            )));
        }
        if completed.is_empty() {
            return Err(SendlinkError::Export(
                "no completed files to export".to_string(),
            ));
        }
        let bundle = self.bundler.bundle(&completed).await?;
        info!(
            files = completed.len(),
            bundle_bytes = bundle.len(),
            "Exported bundle"
        );
        Ok(bundle)
    }
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}
