use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ArborError, Result};
use crate::protocol::message::TreeMessage;
use crate::types::PROTOCOL_VERSION;

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Coarse category of the frame that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Handshake, bootstrap, and control messages.
    Control = 0,
    /// Collective payloads (`Partial`, `Bcast`).
    Data = 1,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Control),
            1 => Some(MessageKind::Data),
            _ => None,
        }
    }
}

/// 8-byte wire header prepended to every frame.
///
/// ```text
/// [0..4] payload_length: u32 LE
/// [4]    version: u8
/// [5]    kind: u8
/// [6..8] reserved: u16 (must be 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the rkyv payload following this header.
    pub payload_length: u32,
    /// Protocol version of the sender.
    pub version: u8,
    /// Category of the payload.
    pub kind: MessageKind,
}

impl Header {
    /// Encode header to 8 bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[4] = self.version;
        buf[5] = self.kind as u8;
        // buf[6..8] reserved = 0
        buf
    }

    /// Decode header from 8 bytes.
    ///
    /// Returns `None` if the kind byte is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let payload_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = buf[4];
        let kind = MessageKind::from_u8(buf[5])?;
        Some(Header {
            payload_length,
            version,
            kind,
        })
    }
}

fn kind_of(msg: &TreeMessage) -> MessageKind {
    match msg {
        TreeMessage::Partial { .. } | TreeMessage::Bcast { .. } => MessageKind::Data,
        _ => MessageKind::Control,
    }
}

/// Encode a `TreeMessage` into a framed byte buffer: `[header][rkyv payload]`.
pub fn encode_message(msg: &TreeMessage) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| ArborError::EncodeFailed(e.to_string()))?;

    if payload.len() > u32::MAX as usize {
        return Err(ArborError::EncodeFailed(format!(
            "payload too large for framed header: {} bytes exceeds u32::MAX",
            payload.len()
        )));
    }

    let header = Header {
        payload_length: payload.len() as u32,
        version: PROTOCOL_VERSION,
        kind: kind_of(msg),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer back into a `(Header, TreeMessage)`.
///
/// The input must contain at least `HEADER_SIZE` bytes, followed by
/// `header.payload_length` bytes of rkyv-encoded payload.
pub fn decode_message(buf: &[u8]) -> Result<(Header, TreeMessage)> {
    if buf.len() < HEADER_SIZE {
        return Err(ArborError::DecodeFailed(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }

    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| ArborError::DecodeFailed("header slice length mismatch".into()))?;

    let header = Header::decode(header_bytes)
        .ok_or_else(|| ArborError::DecodeFailed("invalid header: unknown message kind".into()))?;

    if header.version != PROTOCOL_VERSION {
        return Err(ArborError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: header.version,
        });
    }

    let payload_end = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < payload_end {
        return Err(ArborError::DecodeFailed(format!(
            "buffer too short for payload: {} < {payload_end}",
            buf.len()
        )));
    }

    let payload = &buf[HEADER_SIZE..payload_end];
    let msg = rkyv::from_bytes::<TreeMessage, rkyv::rancor::Error>(payload)
        .map_err(|e| ArborError::DecodeFailed(e.to_string()))?;

    Ok((header, msg))
}

/// Read one framed message from an async stream.
pub(crate) async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<TreeMessage> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = Header::decode(&header_buf)
        .ok_or_else(|| ArborError::DecodeFailed("invalid header: unknown message kind".into()))?;
    if header.version != PROTOCOL_VERSION {
        return Err(ArborError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: header.version,
        });
    }
    let payload_len = header.payload_length as usize;
    if HEADER_SIZE + payload_len > max_frame_bytes {
        return Err(ArborError::DecodeFailed(format!(
            "frame of {} bytes exceeds limit of {max_frame_bytes}",
            HEADER_SIZE + payload_len
        )));
    }

    let mut full_buf = vec![0u8; HEADER_SIZE + payload_len];
    full_buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    reader.read_exact(&mut full_buf[HEADER_SIZE..]).await?;

    let (_, msg) = decode_message(&full_buf)?;
    Ok(msg)
}

/// Write one framed message to an async stream and flush it.
pub(crate) async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &TreeMessage,
) -> Result<()> {
    let buf = encode_message(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
