//! Wire frames for the transfer channel.
//!
//! Three frame kinds ride the channel. Metadata and EndOfFile travel as the
//! channel's text message type, Chunk as its binary type, so the kind is
//! implied by the encoding. Every frame carries its transfer id: metadata as
//! a JSON field, end-of-file appended to the `EOM:` marker, and chunks in a
//! one-byte length-prefixed header ahead of the payload. That header is what
//! lets several files interleave on one channel without a shared "current
//! transfer" pointer on the receive side.
//!
//! Wire format (bit-compatible across implementations):
//! - Metadata: UTF-8 JSON `{"id","filename","filesize","filetype"}`
//! - Chunk: `id_len:u8 | id | payload`, payload at most [`CHUNK_SIZE`]
//! - EndOfFile: UTF-8 text, `"EOM:" + id`

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Fixed window for outbound chunk slicing. The final chunk of a file may
/// be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Text prefix marking an end-of-file frame.
pub const EOM_PREFIX: &str = "EOM:";

/// Suspend sending once the transport backlog exceeds this many bytes.
pub const HIGH_WATERMARK: u64 = 1024 * 1024;

/// Resume sending once the backlog has drained below this.
pub const LOW_WATERMARK: u64 = 256 * 1024;

/// One message as seen by the transport. The channel distinguishes text
/// from binary delivery and the protocol keys off that distinction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    /// Bytes this message contributes to the transport backlog.
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(s) => s.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable per-transfer metadata, sent before the first chunk.
///
/// Field names are the wire format and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Metadata(FileMetadata),
    Chunk { id: String, payload: Bytes },
    EndOfFile { id: String },
}

impl Frame {
    /// The transfer this frame belongs to.
    pub fn transfer_id(&self) -> &str {
        match self {
            Frame::Metadata(meta) => &meta.id,
            Frame::Chunk { id, .. } => id,
            Frame::EndOfFile { id } => id,
        }
    }

    pub fn encode(&self) -> Result<ChannelMessage> {
        match self {
            Frame::Metadata(meta) => {
                let json =
                    serde_json::to_string(meta).context("Failed to encode metadata frame")?;
                Ok(ChannelMessage::Text(json))
            }
            Frame::Chunk { id, payload } => {
                let id_bytes = id.as_bytes();
                if id_bytes.len() > u8::MAX as usize {
                    anyhow::bail!("Transfer id too long for chunk header: {} bytes", id_bytes.len());
                }
                let mut buf = BytesMut::with_capacity(1 + id_bytes.len() + payload.len());
                buf.put_u8(id_bytes.len() as u8);
                buf.put_slice(id_bytes);
                buf.put_slice(payload);
                Ok(ChannelMessage::Binary(buf.freeze()))
            }
            Frame::EndOfFile { id } => Ok(ChannelMessage::Text(format!("{EOM_PREFIX}{id}"))),
        }
    }

    /// Decode one channel message. A text message is tried as EndOfFile
    /// first, then as JSON metadata; a binary message is always a chunk.
    pub fn decode(msg: ChannelMessage) -> Result<Frame> {
        match msg {
            ChannelMessage::Text(text) => {
                if let Some(id) = text.strip_prefix(EOM_PREFIX) {
                    if id.is_empty() {
                        anyhow::bail!("End-of-file frame carries no transfer id");
                    }
                    return Ok(Frame::EndOfFile { id: id.to_string() });
                }
                let meta: FileMetadata =
                    serde_json::from_str(&text).context("Unparseable text frame")?;
                Ok(Frame::Metadata(meta))
            }
            ChannelMessage::Binary(mut payload) => {
                if payload.remaining() < 1 {
                    anyhow::bail!("Chunk frame too short for id header");
                }
                let id_len = payload.get_u8() as usize;
                if id_len == 0 {
                    anyhow::bail!("Chunk frame carries no transfer id");
                }
                if payload.remaining() < id_len {
                    anyhow::bail!(
                        "Chunk id truncated: expected {} bytes, got {}",
                        id_len,
                        payload.remaining()
                    );
                }
                let id = String::from_utf8(payload.copy_to_bytes(id_len).to_vec())
                    .context("Invalid UTF-8 in chunk id")?;
                Ok(Frame::Chunk { id, payload })
            }
        }
    }
}
