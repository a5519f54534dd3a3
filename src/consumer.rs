//! Client side of a transfer.

use crate::error::TransferPhase;
use crate::measurements::{Sample, TransferSession};
use crate::protocol::{read_frame, serialize_message, Frame, Message};
use crate::source::decode_batch_shape;
use crate::{Error, Result};
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time;

/// Pulls one transfer off an open connection and measures it.
#[derive(Debug, Clone, Default)]
pub struct StreamConsumer {
    read_timeout: Option<Duration>,
    decode_batches: bool,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the transfer when no frame arrives within `timeout`.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Validates every chunk as a record batch and counts its rows.
    pub fn with_batch_decoding(mut self, decode: bool) -> Self {
        self.decode_batches = decode;
        self
    }

    /// Requests the dataset named by `ticket` and reads until the end frame.
    ///
    /// The clock starts before the request is written and stops when the
    /// end frame has been read. The end frame must agree with the chunks
    /// actually received and chunk indices must be gap-free; anything else
    /// fails the sample.
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] if the request cannot be written or the
    ///   connection fails or closes before the end frame
    /// - [`Error::Remote`] if the server answers with an error frame
    /// - [`Error::Protocol`] for malformed or inconsistent frames
    pub async fn consume<S>(&self, stream: &mut S, ticket: Option<&str>) -> Result<Sample>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = serialize_message(&Message::request(ticket.map(str::to_string)))?;

        let mut session = TransferSession::start();
        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::transport(TransferPhase::Request, e))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::transport(TransferPhase::Request, e))?;

        let mut buf = Vec::new();
        let mut rows = 0u64;

        loop {
            match self.next_frame(stream, &mut buf).await? {
                Frame::Chunk {
                    sequence_index,
                    len,
                } => {
                    if sequence_index != session.chunk_count {
                        return Err(Error::Protocol(format!(
                            "Expected chunk {}, received chunk {}",
                            session.chunk_count, sequence_index
                        )));
                    }
                    if self.decode_batches {
                        rows += decode_batch_shape(&buf)?.rows as u64;
                    }
                    session.record_chunk(len);
                }
                Frame::End {
                    chunks,
                    total_bytes,
                } => {
                    if chunks != session.chunk_count || total_bytes != session.bytes_so_far {
                        return Err(Error::Protocol(format!(
                            "End frame reports {} chunks / {} bytes, received {} / {}",
                            chunks, total_bytes, session.chunk_count, session.bytes_so_far
                        )));
                    }
                    break;
                }
                Frame::Error { message } => return Err(Error::Remote(message)),
            }
        }

        let mut sample = Sample::from_session(&session);
        if self.decode_batches {
            sample = sample.with_rows(rows);
        }
        if sample.throughput_gibps.is_none() {
            warn!(
                "Transfer of {} bytes took no measurable time, throughput undefined",
                sample.total_bytes
            );
        }
        debug!(
            "Received {} chunks, {} bytes in {} ms",
            sample.chunk_count, sample.total_bytes, sample.elapsed_millis
        );
        Ok(sample)
    }

    async fn next_frame<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        buf: &mut Vec<u8>,
    ) -> Result<Frame> {
        match self.read_timeout {
            None => read_frame(reader, buf).await,
            Some(limit) => match time::timeout(limit, read_frame(reader, buf)).await {
                Ok(frame) => frame,
                Err(_) => Err(Error::transport(
                    TransferPhase::Receive,
                    format!("no frame within {:?}", limit),
                )),
            },
        }
    }
}
