//! Send side: chunker and scheduler.
//!
//! One task owns the outbound half of the channel. Files enter through a
//! [`SendHandle`], which assigns the transfer id up front, and transfer
//! strictly one at a time, in submission order; a file's frames are never
//! interleaved with another file's. Each transfer is metadata, then
//! fixed-size chunks, then end-of-file.
//!
//! Chunking is pull-based: the next slice is read only when the transport
//! backlog is below the high watermark, so a slow peer stalls the reader
//! instead of ballooning memory. A stalled sender resumes once the backlog
//! drains to the low watermark, or aborts when the channel closes.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SendlinkError;
use crate::transfer::channel::{
    FileSource, IdAllocator, OutboundFile, TransferEvent, TransferId,
};
use crate::transfer::protocol::{
    FileMetadata, Frame, CHUNK_SIZE, HIGH_WATERMARK, LOW_WATERMARK,
};
use crate::transfer::transport::Channel;

/// Tuning for the send loop. Defaults match the wire constants; tests
/// shrink them to exercise suspension without megabytes of traffic.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    pub high_watermark: u64,
    pub low_watermark: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
        }
    }
}

/// Sequential reader over either source kind, yielding chunk-sized slices.
enum SourceReader {
    Memory(Bytes),
    Disk(BufReader<tokio::fs::File>),
}

impl SourceReader {
    async fn open(source: &FileSource) -> Result<Self, SendlinkError> {
        match source {
            FileSource::Memory(bytes) => Ok(SourceReader::Memory(bytes.clone())),
            FileSource::Disk(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| SendlinkError::FileRead(format!("{}: {e}", path.display())))?;
                Ok(SourceReader::Disk(BufReader::new(file)))
            }
        }
    }

    /// Next slice of at most `chunk_size` bytes, or `None` at end of file.
    /// Every chunk before the last is exactly `chunk_size` long.
    async fn next_chunk(&mut self, chunk_size: usize) -> Result<Option<Bytes>, SendlinkError> {
        match self {
            SourceReader::Memory(remaining) => {
                if remaining.is_empty() {
                    return Ok(None);
                }
                let take = chunk_size.min(remaining.len());
                Ok(Some(remaining.split_to(take)))
            }
            SourceReader::Disk(reader) => {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < chunk_size {
                    let n = reader
                        .read(&mut buf[filled..])
                        .await
                        .map_err(|e| SendlinkError::FileRead(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }
}

/// Capacity of the job queue feeding the scheduler. [`SendHandle::enqueue`]
/// backpressures once this many files are waiting.
pub const JOB_QUEUE_DEPTH: usize = 64;

struct SendJob {
    id: TransferId,
    file: OutboundFile,
}

/// Submission side of the send queue. Cheap to clone; dropping every
/// handle closes the queue and lets the scheduler task finish.
#[derive(Clone)]
pub struct SendHandle {
    jobs: mpsc::Sender<SendJob>,
    ids: Arc<IdAllocator>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl SendHandle {
    /// Append a file to the queue and return its transfer id. Fails once
    /// the scheduler has exited, which only happens on channel closure.
    pub async fn enqueue(&self, file: OutboundFile) -> Result<TransferId, SendlinkError> {
        let id = self.ids.allocate();
        // announced before submission so the queued event always precedes
        // the scheduler's started event for the same id
        let _ = self.events.send(TransferEvent::SendQueued {
            id: id.clone(),
            filename: file.name.clone(),
        });
        self.jobs
            .send(SendJob {
                id: id.clone(),
                file,
            })
            .await
            .map_err(|_| SendlinkError::TransportClosed)?;
        Ok(id)
    }
}

/// The send scheduler. Owns the outbound channel half for its lifetime.
pub struct SendQueue {
    channel: Arc<dyn Channel>,
    events: mpsc::UnboundedSender<TransferEvent>,
    jobs: mpsc::Receiver<SendJob>,
    config: SenderConfig,
}

impl SendQueue {
    pub fn new(
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (SendHandle, Self) {
        Self::with_config(channel, events, SenderConfig::default())
    }

    pub fn with_config(
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedSender<TransferEvent>,
        config: SenderConfig,
    ) -> (SendHandle, Self) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
        let handle = SendHandle {
            jobs: jobs_tx,
            ids: Arc::new(IdAllocator::new()),
            events: events.clone(),
        };
        let queue = Self {
            channel,
            events,
            jobs: jobs_rx,
            config,
        };
        (handle, queue)
    }

    /// Drain the job queue until every handle is dropped or the channel
    /// dies.
    ///
    /// A read failure fails only that transfer; the queue advances. A
    /// closed channel fails the active transfer and everything still
    /// queued, then returns the error.
    pub async fn run(mut self) -> Result<(), SendlinkError> {
        while let Some(SendJob { id, file }) = self.jobs.recv().await {
            match self.send_file(&id, &file).await {
                Ok(()) => {
                    info!(%id, filename = %file.name, size = file.size, "Transfer sent");
                    self.emit(TransferEvent::SendCompleted { id });
                }
                Err(SendlinkError::TransportClosed) => {
                    warn!(%id, filename = %file.name, "Channel closed mid-transfer");
                    self.emit(TransferEvent::SendFailed {
                        id,
                        reason: SendlinkError::TransportClosed.to_string(),
                    });
                    self.fail_remaining();
                    return Err(SendlinkError::TransportClosed);
                }
                Err(e) => {
                    warn!(%id, filename = %file.name, "Transfer failed: {e}");
                    self.emit(TransferEvent::SendFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        debug!("Job queue closed, send loop exiting");
        Ok(())
    }

    async fn send_file(&self, id: &TransferId, file: &OutboundFile) -> Result<(), SendlinkError> {
        self.emit(TransferEvent::SendStarted {
            id: id.clone(),
            filename: file.name.clone(),
            filesize: file.size,
        });

        let meta = FileMetadata {
            id: id.clone(),
            filename: file.name.clone(),
            filesize: file.size,
            filetype: file.mime_type.clone(),
        };
        self.send_frame(Frame::Metadata(meta)).await?;

        let mut reader = SourceReader::open(&file.source).await?;
        let mut sent: u64 = 0;
        loop {
            self.wait_for_capacity().await?;
            let Some(payload) = reader.next_chunk(self.config.chunk_size).await? else {
                break;
            };
            sent += payload.len() as u64;
            self.send_frame(Frame::Chunk {
                id: id.clone(),
                payload,
            })
            .await?;
            self.emit(TransferEvent::SendProgress {
                id: id.clone(),
                bytes_sent: sent,
                filesize: file.size,
            });
        }

        self.send_frame(Frame::EndOfFile { id: id.clone() }).await
    }

    /// Block while the backlog sits above the high watermark. Returns once
    /// it drains to the low watermark, or errors if the channel closes
    /// during the wait.
    async fn wait_for_capacity(&self) -> Result<(), SendlinkError> {
        if self.channel.backlog_bytes() <= self.config.high_watermark {
            return Ok(());
        }
        debug!(
            backlog = self.channel.backlog_bytes(),
            "Backlog above high watermark, suspending"
        );
        tokio::select! {
            _ = self.channel.drained(self.config.low_watermark) => {
                if self.channel.is_open() {
                    Ok(())
                } else {
                    Err(SendlinkError::TransportClosed)
                }
            }
            _ = self.channel.closed() => Err(SendlinkError::TransportClosed),
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SendlinkError> {
        let msg = frame
            .encode()
            .map_err(|e| SendlinkError::MalformedFrame(format!("{e:#}")))?;
        self.channel.send(msg).await
    }

    fn fail_remaining(&mut self) {
        self.jobs.close();
        while let Ok(SendJob { id, file }) = self.jobs.try_recv() {
            self.emit(TransferEvent::SendFailed {
                id,
                reason: format!("{} ({})", SendlinkError::TransportClosed, file.name),
            });
        }
    }

    fn emit(&self, event: TransferEvent) {
        // the event stream is observability, a dropped receiver is not an
        // error for the transfer itself
        let _ = self.events.send(event);
    }
}
