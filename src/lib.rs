//! sendlink: relay-less peer-to-peer file transfer core.
//!
//! Moves whole files between exactly two peers over a single ordered,
//! reliable message channel. The crate owns chunking under backpressure,
//! the wire frames, send scheduling, receive demultiplexing, pluggable
//! destinations for incoming bytes, and batch export of everything
//! received. It does not own the wire: any transport that delivers ordered
//! text and binary messages plugs in behind the [`Channel`] trait.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sendlink::{event_channel, MemoryChannel, OutboundFile, Receiver, SendQueue};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let ((local, _), (remote, remote_rx)) = MemoryChannel::pair();
//! let (events_tx, mut events) = event_channel();
//!
//! let receiver = Receiver::new(events_tx.clone());
//! let artifacts = receiver.artifacts();
//! tokio::spawn(receiver.run(remote_rx, Arc::new(remote)));
//!
//! let (sender, queue) = SendQueue::new(Arc::new(local), events_tx);
//! tokio::spawn(queue.run());
//!
//! let id = sender
//!     .enqueue(OutboundFile::from_bytes("hello.txt", &b"hi there"[..]))
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     // watch progress, completion, failures
//!     let _ = (&id, event);
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod transfer;

pub use error::SendlinkError;
pub use transfer::{
    decode_bundle, event_channel, Artifact, ArtifactData, ArtifactSet, BacklogHandle, BundleEntry,
    Bundler, Channel, ChannelMessage, DirStreamFactory, ExportPolicy, Exporter, FileMetadata,
    FileSource, Frame, MemoryChannel, OutboundFile, ReceiveState, Receiver, ReceiverConfig,
    SendHandle, SendQueue, SendState, SenderConfig, StoreBundler, StreamFactory, StreamWriter,
    TransferEvent, TransferId, TransferSink, CHUNK_SIZE, EOM_PREFIX, HIGH_WATERMARK, LOW_WATERMARK,
};
