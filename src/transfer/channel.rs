//! Shared types for the transfer pipeline.
//!
//! Sender and receiver communicate with their host application through the
//! channels built here: a bounded job queue feeding the send scheduler and
//! an unbounded event stream reporting per-transfer lifecycle changes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SendlinkError;
use crate::transfer::sink::Artifact;

/// Opaque per-transfer identifier, unique for the lifetime of a channel.
pub type TransferId = String;

/// Monotonic id source for outbound transfers. Uniqueness only needs to
/// hold per channel lifetime, so a counter is enough.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> TransferId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("t{n}")
    }
}

/// Sender-side lifecycle of one queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Queued,
    Active,
    Completed,
    Failed,
}

/// Receiver-side lifecycle of one incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitingMetadata,
    Receiving,
    Finalizing,
    Complete,
    Error,
}

/// Lifecycle notifications emitted by both halves of the pipeline.
///
/// Progress events carry cumulative byte counts; consumers derive
/// percentages from the declared size themselves. [`send_state`] and
/// [`receive_state`] map each event onto the state it announces, so a
/// consumer can mirror the transfer state machines from the stream alone.
///
/// [`send_state`]: TransferEvent::send_state
/// [`receive_state`]: TransferEvent::receive_state
#[derive(Debug, Clone)]
pub enum TransferEvent {
    SendQueued {
        id: TransferId,
        filename: String,
    },
    SendStarted {
        id: TransferId,
        filename: String,
        filesize: u64,
    },
    SendProgress {
        id: TransferId,
        bytes_sent: u64,
        filesize: u64,
    },
    SendCompleted {
        id: TransferId,
    },
    SendFailed {
        id: TransferId,
        reason: String,
    },
    ReceiveStarted {
        id: TransferId,
        filename: String,
        filesize: u64,
    },
    ReceiveProgress {
        id: TransferId,
        bytes_received: u64,
        filesize: u64,
    },
    ReceiveCompleted {
        id: TransferId,
        artifact: Artifact,
    },
    ReceiveFailed {
        id: TransferId,
        reason: String,
    },
    /// A newer transfer displaced this one before its end-of-file arrived.
    ReceiveAbandoned {
        id: TransferId,
    },
    /// A frame was discarded without being attributed to any transfer.
    ProtocolError {
        detail: String,
    },
}

impl TransferEvent {
    /// The sender-side state this event moves its transfer into, if any.
    pub fn send_state(&self) -> Option<SendState> {
        match self {
            TransferEvent::SendQueued { .. } => Some(SendState::Queued),
            TransferEvent::SendStarted { .. } | TransferEvent::SendProgress { .. } => {
                Some(SendState::Active)
            }
            TransferEvent::SendCompleted { .. } => Some(SendState::Completed),
            TransferEvent::SendFailed { .. } => Some(SendState::Failed),
            _ => None,
        }
    }

    /// The receiver-side state this event moves its transfer into, if any.
    pub fn receive_state(&self) -> Option<ReceiveState> {
        match self {
            TransferEvent::ReceiveStarted { .. } | TransferEvent::ReceiveProgress { .. } => {
                Some(ReceiveState::Receiving)
            }
            TransferEvent::ReceiveCompleted { .. } => Some(ReceiveState::Complete),
            TransferEvent::ReceiveFailed { .. } | TransferEvent::ReceiveAbandoned { .. } => {
                Some(ReceiveState::Error)
            }
            _ => None,
        }
    }
}

/// Build the event stream. Unbounded: events are small and consumers that
/// fall behind must not stall the transfer loops.
pub fn event_channel() -> (
    mpsc::UnboundedSender<TransferEvent>,
    mpsc::UnboundedReceiver<TransferEvent>,
) {
    mpsc::unbounded_channel()
}

/// Where an outbound file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Disk(PathBuf),
}

/// One file handed to the send scheduler.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub source: FileSource,
}

impl OutboundFile {
    /// Queue a file from disk. The size is captured now; the file must not
    /// change length before its turn in the queue.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self, SendlinkError> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SendlinkError::FileRead(format!("{}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok(Self {
            name,
            size: meta.len(),
            mime_type: "application/octet-stream".to_string(),
            source: FileSource::Disk(path),
        })
    }

    /// Queue an in-memory payload.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".to_string(),
            source: FileSource::Memory(data),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_allocator_is_monotonic() {
        let ids = IdAllocator::new();
        assert_eq!(ids.allocate(), "t1");
        assert_eq!(ids.allocate(), "t2");
        assert_eq!(ids.allocate(), "t3");
    }

    #[test]
    fn test_outbound_from_bytes_captures_size() {
        let file = OutboundFile::from_bytes("notes.txt", &b"hello"[..]).with_mime_type("text/plain");
        assert_eq!(file.size, 5);
        assert_eq!(file.mime_type, "text/plain");
        assert!(matches!(file.source, FileSource::Memory(_)));
    }

    #[tokio::test]
    async fn test_outbound_from_missing_path_is_file_read_error() {
        let err = OutboundFile::from_path("/nonexistent/certainly/missing.bin").await;
        assert!(matches!(err, Err(SendlinkError::FileRead(_))));
    }

    #[test]
    fn test_events_map_onto_send_states() {
        let id = || "t1".to_string();
        let cases = [
            (
                TransferEvent::SendQueued {
                    id: id(),
                    filename: "a.bin".to_string(),
                },
                SendState::Queued,
            ),
            (
                TransferEvent::SendStarted {
                    id: id(),
                    filename: "a.bin".to_string(),
                    filesize: 10,
                },
                SendState::Active,
            ),
            (
                TransferEvent::SendProgress {
                    id: id(),
                    bytes_sent: 5,
                    filesize: 10,
                },
                SendState::Active,
            ),
            (TransferEvent::SendCompleted { id: id() }, SendState::Completed),
            (
                TransferEvent::SendFailed {
                    id: id(),
                    reason: "boom".to_string(),
                },
                SendState::Failed,
            ),
        ];
        for (event, state) in cases {
            assert_eq!(event.send_state(), Some(state));
            assert_eq!(event.receive_state(), None);
        }
    }

    #[test]
    fn test_events_map_onto_receive_states() {
        let id = || "t1".to_string();
        let cases = [
            (
                TransferEvent::ReceiveStarted {
                    id: id(),
                    filename: "a.bin".to_string(),
                    filesize: 10,
                },
                ReceiveState::Receiving,
            ),
            (
                TransferEvent::ReceiveFailed {
                    id: id(),
                    reason: "boom".to_string(),
                },
                ReceiveState::Error,
            ),
            (
                TransferEvent::ReceiveAbandoned { id: id() },
                ReceiveState::Error,
            ),
        ];
        for (event, state) in cases {
            assert_eq!(event.receive_state(), Some(state));
            assert_eq!(event.send_state(), None);
        }
        assert_eq!(
            TransferEvent::ProtocolError {
                detail: "junk".to_string()
            }
            .send_state(),
            None
        );
    }
}
