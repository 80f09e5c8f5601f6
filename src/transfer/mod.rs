//! Peer-to-peer file transfer pipeline.
//!
//! Data flow, sender on the left, receiver on the right:
//!
//! ```text
//!  SendHandle ──▶ job queue ──▶ SendQueue ──▶ Channel ═══▶ Receiver
//!                                  │ chunker                    │ demux
//!                                  ▼                            ▼
//!                             backpressure                 TransferSink
//!                            (watermarks on               (buffered or
//!                             channel backlog)             streaming)
//!                                                              │
//!                                                              ▼
//!                                                         ArtifactSet ──▶ Exporter
//! ```
//!
//! Each direction is one task owning its half of the channel. Both report
//! through a shared [`TransferEvent`] stream.
//!
//! [`TransferEvent`]: channel::TransferEvent

pub mod channel;
pub mod export;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod transport;

pub use channel::{
    event_channel, FileSource, IdAllocator, OutboundFile, ReceiveState, SendState, TransferEvent,
    TransferId,
};
pub use export::{decode_bundle, ArtifactSet, BundleEntry, Bundler, ExportPolicy, Exporter, StoreBundler};
pub use protocol::{
    ChannelMessage, FileMetadata, Frame, CHUNK_SIZE, EOM_PREFIX, HIGH_WATERMARK, LOW_WATERMARK,
};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{SendHandle, SendQueue, SenderConfig, JOB_QUEUE_DEPTH};
pub use sink::{
    Artifact, ArtifactData, DirStreamFactory, StreamFactory, StreamWriter, TransferSink,
};
pub use transport::{BacklogHandle, Channel, MemoryChannel};
