//! Network Module
//!
//! Handles TCP communication between shipping clients and the collector.
//!
//! Every frame is `[version u16][length u32][crc32 u32][body]`, little-endian.
//! The version lets a collector refuse a body it cannot decode without
//! losing its place in the stream.

mod client;
mod control;
mod protocol;
mod server;

pub use client::{ReplicatorClient, SyncReport};
pub use control::{ControlState, SessionCursor};
pub use protocol::{
    is_supported_version, ErrorCode, FrameHeader, Message, WireMessage, MAX_FRAME_BYTES,
    MIN_PROTOCOL_VERSION,
};
pub use server::CollectorServer;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// A long-running pipeline component with an orderly shutdown
#[async_trait]
pub trait Component: Send + Sync {
    /// Name used in shutdown logs
    fn name(&self) -> &str;

    /// Drain pending work and stop
    async fn stop(&self) -> Result<()>;
}

/// What arrived in one frame
#[derive(Debug)]
pub enum Frame {
    /// A decoded message
    Message(Message),
    /// A frame stamped with a version this build cannot decode
    UnsupportedVersion(u16),
    /// A frame whose body failed its checksum or did not decode
    Corrupt { code: ErrorCode, reason: String },
}

/// Read one frame. Only transport failures are errors; a bad body is
/// returned as a `Frame` so the connection can carry on.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    header.check_length()?;

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if !is_supported_version(header.version) {
        return Ok(Frame::UnsupportedVersion(header.version));
    }

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Ok(Frame::Corrupt {
            code: ErrorCode::Checksum,
            reason: format!(
                "Checksum mismatch: header {:08x}, body {:08x}",
                header.checksum, computed_checksum
            ),
        });
    }

    // Deserialize
    match Message::deserialize(&body) {
        Ok(message) => Ok(Frame::Message(message)),
        Err(e) => Ok(Frame::Corrupt {
            code: ErrorCode::Decode,
            reason: e.to_string(),
        }),
    }
}

/// Read a framed message, treating any bad frame as an error
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    match read_frame(reader).await? {
        Frame::Message(message) => Ok(message),
        Frame::UnsupportedVersion(version) => Err(Error::UnsupportedProtocolVersion(version)),
        Frame::Corrupt { reason, .. } => Err(Error::Network(reason)),
    }
}

/// Write a framed message to a writer
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.serialize()?;
    write_raw_frame(writer, FrameHeader::new(&body), &body).await
}

/// Write a header and body as given, without re-deriving either
pub async fn write_raw_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: FrameHeader,
    body: &[u8],
) -> Result<()> {
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}
