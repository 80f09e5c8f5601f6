//! Receive side: frame demultiplexer and per-transfer state machines.
//!
//! One task owns the inbound half of the channel. Every frame names its
//! transfer, so routing is a map lookup with no cross-transfer ordering
//! assumptions: chunks of different transfers may interleave freely as
//! long as each transfer's own frames stay in order, which the transport
//! guarantees.
//!
//! Anything that cannot be attributed to a live transfer is logged and
//! dropped. A malformed frame never tears down the channel or any other
//! transfer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SendlinkError;
use crate::transfer::channel::{ReceiveState, TransferEvent, TransferId};
use crate::transfer::export::ArtifactSet;
use crate::transfer::protocol::{ChannelMessage, FileMetadata, Frame, CHUNK_SIZE};
use crate::transfer::sink::{StreamFactory, TransferSink};
use crate::transfer::transport::Channel;

/// Tuning for the receive loop.
#[derive(Clone, Default)]
pub struct ReceiverConfig {
    /// How many transfers may be mid-receive at once. Zero is treated as
    /// one. Admitting a transfer past the limit abandons the oldest one
    /// still receiving; fresh metadata always wins over a stale transfer.
    pub max_in_flight: usize,
    /// Streaming destination provider. Absent, every transfer buffers in
    /// memory until end-of-file.
    pub stream_factory: Option<Arc<dyn StreamFactory>>,
}

struct TransferRecord {
    meta: FileMetadata,
    sink: TransferSink,
    bytes_received: u64,
    state: ReceiveState,
}

/// The receive demultiplexer.
pub struct Receiver {
    config: ReceiverConfig,
    transfers: HashMap<TransferId, TransferRecord>,
    /// Admission order, oldest first. Drives abandonment.
    order: VecDeque<TransferId>,
    /// Terminal state of every transfer that has left the live map.
    settled: HashMap<TransferId, ReceiveState>,
    artifacts: Arc<ArtifactSet>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl Receiver {
    pub fn new(events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self::with_config(events, ReceiverConfig::default())
    }

    pub fn with_config(
        events: mpsc::UnboundedSender<TransferEvent>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            config,
            transfers: HashMap::new(),
            order: VecDeque::new(),
            settled: HashMap::new(),
            artifacts: Arc::new(ArtifactSet::new()),
            events,
        }
    }

    /// Lifecycle state of a transfer as this receiver knows it. Ids never
    /// announced report `AwaitingMetadata`.
    pub fn state(&self, id: &str) -> ReceiveState {
        if let Some(record) = self.transfers.get(id) {
            return record.state;
        }
        self.settled
            .get(id)
            .copied()
            .unwrap_or(ReceiveState::AwaitingMetadata)
    }

    /// Handle to the completed-artifact set. Grab before [`run`] consumes
    /// the receiver.
    ///
    /// [`run`]: Receiver::run
    pub fn artifacts(&self) -> Arc<ArtifactSet> {
        Arc::clone(&self.artifacts)
    }

    /// Consume inbound messages until the stream ends or the channel
    /// closes, then fail whatever is still in flight.
    pub async fn run(
        mut self,
        mut incoming: mpsc::UnboundedReceiver<ChannelMessage>,
        channel: Arc<dyn Channel>,
    ) {
        loop {
            tokio::select! {
                msg = incoming.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                _ = channel.closed() => break,
            }
        }
        self.teardown().await;
    }

    /// Route one decoded frame. Public for driving the receiver without a
    /// live channel.
    pub async fn handle_message(&mut self, msg: ChannelMessage) {
        let frame = match Frame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding malformed frame: {e:#}");
                self.emit(TransferEvent::ProtocolError {
                    detail: format!("{e:#}"),
                });
                return;
            }
        };
        match frame {
            Frame::Metadata(meta) => self.on_metadata(meta).await,
            Frame::Chunk { id, payload } => self.on_chunk(&id, &payload).await,
            Frame::EndOfFile { id } => self.on_eof(&id).await,
        }
    }

    async fn on_metadata(&mut self, meta: FileMetadata) {
        // re-announced id restarts that transfer from scratch
        if self.transfers.contains_key(&meta.id) {
            warn!(id = %meta.id, "Metadata re-announced mid-transfer, restarting");
            self.abandon(&meta.id).await;
        }

        let limit = self.config.max_in_flight.max(1);
        while self.transfers.len() >= limit {
            let Some(oldest) = self.order.front().cloned() else {
                break;
            };
            debug!(
                stale = %oldest,
                incoming = %meta.id,
                "In-flight limit reached, abandoning oldest transfer"
            );
            self.abandon(&oldest).await;
        }

        let mut sink = TransferSink::new(meta.clone());
        if let Some(factory) = &self.config.stream_factory {
            sink.upgrade(factory.as_ref()).await;
        }

        info!(id = %meta.id, filename = %meta.filename, size = meta.filesize, "Transfer started");
        self.artifacts.begin();
        self.emit(TransferEvent::ReceiveStarted {
            id: meta.id.clone(),
            filename: meta.filename.clone(),
            filesize: meta.filesize,
        });
        self.order.push_back(meta.id.clone());
        self.settled.remove(&meta.id);
        self.transfers.insert(
            meta.id.clone(),
            TransferRecord {
                meta,
                sink,
                bytes_received: 0,
                state: ReceiveState::Receiving,
            },
        );
    }

    async fn on_chunk(&mut self, id: &str, payload: &[u8]) {
        let Some(record) = self.transfers.get_mut(id) else {
            warn!(%id, len = payload.len(), "Chunk for unknown transfer, discarding");
            self.emit(TransferEvent::ProtocolError {
                detail: format!("chunk for unknown transfer {id}"),
            });
            return;
        };
        if record.state != ReceiveState::Receiving {
            warn!(%id, state = ?record.state, "Chunk outside receiving state, discarding");
            self.emit(TransferEvent::ProtocolError {
                detail: format!("chunk for transfer {id} outside receiving state"),
            });
            return;
        }

        let projected = record.bytes_received + payload.len() as u64;
        // allow one chunk of slack before declaring the stream corrupt
        if projected > record.meta.filesize + CHUNK_SIZE as u64 {
            let err = SendlinkError::SizeMismatch {
                id: id.to_string(),
                received: projected,
                declared: record.meta.filesize,
            };
            warn!(%id, "Aborting transfer: {err}");
            self.fail(id, err.to_string()).await;
            return;
        }

        if let Err(e) = record.sink.write(payload).await {
            warn!(%id, "Aborting transfer: {e}");
            self.fail(id, e.to_string()).await;
            return;
        }

        let record = match self.transfers.get_mut(id) {
            Some(r) => r,
            None => return,
        };
        record.bytes_received = projected;
        let filesize = record.meta.filesize;
        self.emit(TransferEvent::ReceiveProgress {
            id: id.to_string(),
            bytes_received: projected,
            filesize,
        });
    }

    async fn on_eof(&mut self, id: &str) {
        let Some(mut record) = self.transfers.remove(id) else {
            // duplicate end-of-file after completion is a no-op
            debug!(%id, "End-of-file for unknown transfer, ignoring");
            return;
        };
        self.order.retain(|t| t != id);
        record.state = ReceiveState::Finalizing;

        if record.bytes_received != record.meta.filesize {
            let err = SendlinkError::SizeMismatch {
                id: id.to_string(),
                received: record.bytes_received,
                declared: record.meta.filesize,
            };
            warn!(%id, "Rejecting transfer at end-of-file: {err}");
            record.sink.abandon().await;
            self.artifacts.fail();
            self.settled.insert(id.to_string(), ReceiveState::Error);
            self.emit(TransferEvent::ReceiveFailed {
                id: id.to_string(),
                reason: err.to_string(),
            });
            return;
        }

        match record.sink.finalize().await {
            Ok(artifact) => {
                info!(%id, name = %artifact.name, size = artifact.size, "Transfer complete");
                self.artifacts.complete(artifact.clone());
                self.settled.insert(id.to_string(), ReceiveState::Complete);
                self.emit(TransferEvent::ReceiveCompleted {
                    id: id.to_string(),
                    artifact,
                });
            }
            Err(e) => {
                warn!(%id, "Finalize failed: {e}");
                self.artifacts.fail();
                self.settled.insert(id.to_string(), ReceiveState::Error);
                self.emit(TransferEvent::ReceiveFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Drop an in-flight transfer without an error, announcing abandonment.
    async fn abandon(&mut self, id: &str) {
        if let Some(record) = self.transfers.remove(id) {
            self.order.retain(|t| t != id);
            record.sink.abandon().await;
            self.artifacts.fail();
            self.settled.insert(id.to_string(), ReceiveState::Error);
            self.emit(TransferEvent::ReceiveAbandoned { id: id.to_string() });
        }
    }

    /// Drop an in-flight transfer with a terminal error.
    async fn fail(&mut self, id: &str, reason: String) {
        if let Some(record) = self.transfers.remove(id) {
            self.order.retain(|t| t != id);
            record.sink.abandon().await;
            self.artifacts.fail();
            self.settled.insert(id.to_string(), ReceiveState::Error);
            self.emit(TransferEvent::ReceiveFailed {
                id: id.to_string(),
                reason,
            });
        }
    }

    async fn teardown(&mut self) {
        let in_flight: Vec<TransferId> = self.order.iter().cloned().collect();
        for id in in_flight {
            warn!(%id, "Channel closed with transfer in flight");
            self.fail(&id, SendlinkError::TransportClosed.to_string()).await;
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}
