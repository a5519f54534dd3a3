use crate::error::TransferPhase;
use crate::security::rejected_handshake;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version for client-server communication.
///
/// The server refuses requests carrying a different version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a JSON control message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_SIZE: usize = crate::config::MAX_CHUNK_SIZE;

/// Size of a frame header: kind (1 byte), sequence (8 bytes), length (4 bytes).
pub const FRAME_HEADER_SIZE: usize = 13;

/// Control messages sent by the client.
///
/// Messages are serialized as JSON with a `type` field discriminator and a
/// 4-byte big-endian length prefix.
///
/// # Examples
///
/// ```
/// use streamperf::protocol::{Message, PROTOCOL_VERSION};
///
/// let request = Message::request(Some("table".to_string()));
/// assert!(matches!(
///     request,
///     Message::Request { version: PROTOCOL_VERSION, .. }
/// ));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Ask the server to stream a dataset
    Request {
        version: u32,
        ticket: Option<String>,
    },
}

impl Message {
    /// Creates a request for the dataset named by `ticket`, or the
    /// server's default dataset when `None`.
    pub fn request(ticket: Option<String>) -> Self {
        Message::Request {
            version: PROTOCOL_VERSION,
            ticket,
        }
    }
}

/// Serializes a control message to length-prefixed JSON bytes.
///
/// # Examples
///
/// ```
/// use streamperf::protocol::{serialize_message, Message};
///
/// let bytes = serialize_message(&Message::request(None)).unwrap();
/// let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
/// assert_eq!(len as usize, bytes.len() - 4);
/// ```
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Reads one length-prefixed JSON control message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending anything, which is how a client ends a shared connection.
pub async fn deserialize_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "Control message of {} bytes exceeds limit of {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut json_bytes = vec![0u8; len];
    reader.read_exact(&mut json_bytes).await?;

    let msg = serde_json::from_slice(&json_bytes)?;
    Ok(Some(msg))
}

/// Discriminator of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// One chunk of the payload
    Chunk = 0,
    /// Clean end of the transfer
    End = 1,
    /// The server refused or aborted the transfer
    Error = 2,
}

impl FrameKind {
    pub fn from_u8(kind: u8) -> Result<Self> {
        match kind {
            0 => Ok(FrameKind::Chunk),
            1 => Ok(FrameKind::End),
            2 => Ok(FrameKind::Error),
            other => Err(Error::Protocol(format!("Invalid frame kind: {}", other))),
        }
    }
}

/// Fixed header preceding every response frame.
///
/// For a chunk `seq` is the chunk's sequence index; for the end frame it
/// is the number of chunks sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub seq: u64,
    pub len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1..9].copy_from_slice(&self.seq.to_be_bytes());
        buf[9..13].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let kind = FrameKind::from_u8(buf[0])?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[9..13]);
        Ok(Self {
            kind,
            seq: u64::from_be_bytes(seq),
            len: u32::from_be_bytes(len),
        })
    }
}

/// One bounded-size unit of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub sequence_index: u64,
    pub payload: &'a [u8],
}

/// A decoded response frame. Chunk payloads are left in the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk { sequence_index: u64, len: usize },
    End { chunks: u64, total_bytes: u64 },
    Error { message: String },
}

fn send_error(err: std::io::Error) -> Error {
    Error::transport(TransferPhase::Send, err)
}

/// Writes one chunk frame. The payload is written straight from the
/// caller's slice.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &Chunk<'_>) -> Result<()> {
    let len = u32::try_from(chunk.payload.len()).map_err(|_| {
        Error::Protocol(format!("Chunk of {} bytes is too large", chunk.payload.len()))
    })?;
    let header = FrameHeader {
        kind: FrameKind::Chunk,
        seq: chunk.sequence_index,
        len,
    };
    writer.write_all(&header.encode()).await.map_err(send_error)?;
    writer.write_all(chunk.payload).await.map_err(send_error)?;
    Ok(())
}

/// Writes the end-of-stream trailer and flushes.
pub async fn write_end<W: AsyncWrite + Unpin>(
    writer: &mut W,
    chunks: u64,
    total_bytes: u64,
) -> Result<()> {
    let header = FrameHeader {
        kind: FrameKind::End,
        seq: chunks,
        len: 8,
    };
    writer.write_all(&header.encode()).await.map_err(send_error)?;
    writer
        .write_all(&total_bytes.to_be_bytes())
        .await
        .map_err(send_error)?;
    writer.flush().await.map_err(send_error)?;
    Ok(())
}

/// Writes an error frame and flushes.
pub async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<()> {
    let bytes = message.as_bytes();
    let bytes = &bytes[..bytes.len().min(MAX_MESSAGE_SIZE)];
    let header = FrameHeader {
        kind: FrameKind::Error,
        seq: 0,
        len: bytes.len() as u32,
    };
    writer.write_all(&header.encode()).await.map_err(send_error)?;
    writer.write_all(bytes).await.map_err(send_error)?;
    writer.flush().await.map_err(send_error)?;
    Ok(())
}

fn receive_error(err: std::io::Error) -> Error {
    if let Some(tls) = rejected_handshake(&err) {
        Error::Handshake(format!("peer rejected the connection: {}", tls))
    } else if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::transport(
            TransferPhase::Receive,
            "connection closed before end of stream",
        )
    } else {
        Error::transport(TransferPhase::Receive, err)
    }
}

/// Reads the next response frame.
///
/// A chunk's payload is read into `buf`, which is resized to the payload
/// length and reused across calls. End-of-file before the end frame is a
/// transport error, never a clean end.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Frame> {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(receive_error)?;
    let header = FrameHeader::decode(&header_bytes)?;
    let len = header.len as usize;

    match header.kind {
        FrameKind::Chunk => {
            if len > MAX_FRAME_SIZE {
                return Err(Error::Protocol(format!(
                    "Chunk of {} bytes exceeds limit of {}",
                    len, MAX_FRAME_SIZE
                )));
            }
            buf.resize(len, 0);
            reader.read_exact(buf).await.map_err(receive_error)?;
            Ok(Frame::Chunk {
                sequence_index: header.seq,
                len,
            })
        }
        FrameKind::End => {
            if len != 8 {
                return Err(Error::Protocol(format!(
                    "End frame carries {} bytes, expected 8",
                    len
                )));
            }
            let mut total = [0u8; 8];
            reader.read_exact(&mut total).await.map_err(receive_error)?;
            Ok(Frame::End {
                chunks: header.seq,
                total_bytes: u64::from_be_bytes(total),
            })
        }
        FrameKind::Error => {
            if len > MAX_MESSAGE_SIZE {
                return Err(Error::Protocol(format!(
                    "Error frame of {} bytes exceeds limit of {}",
                    len, MAX_MESSAGE_SIZE
                )));
            }
            let mut message = vec![0u8; len];
            reader.read_exact(&mut message).await.map_err(receive_error)?;
            Ok(Frame::Error {
                message: String::from_utf8_lossy(&message).into_owned(),
            })
        }
    }
}
