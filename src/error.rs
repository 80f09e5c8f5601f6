//! Error surface for the transfer engine.
//!
//! Per-transfer failures never halt the queue or other in-flight transfers;
//! only `TransportClosed` fans out to everything riding the channel. All
//! variants are surfaced as events plus state transitions, never as process
//! termination.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendlinkError {
    /// The channel closed mid-transfer. Fatal to the active transfer and
    /// everything queued behind it.
    #[error("transport closed")]
    TransportClosed,

    /// Sender-side I/O failure while slicing the file.
    #[error("file read failed: {0}")]
    FileRead(String),

    /// Unparseable text frame or a chunk received out of context. Logged
    /// and discarded; never fatal to the channel.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The receiver counted more bytes than the metadata declared. Fatal
    /// to that transfer only.
    #[error("transfer {id} received {received} bytes, declared {declared}")]
    SizeMismatch {
        id: String,
        received: u64,
        declared: u64,
    },

    /// A streaming sink write failed past the point of buffered fallback.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// Bundle assembly failed. Fatal to the batch operation only;
    /// individual artifacts remain intact.
    #[error("export failed: {0}")]
    Export(String),
}
