//! Server side of a transfer.
//!
//! Chunks are written one at a time and each write completes before the
//! next chunk is produced, so a slow reader throttles the producer and at
//! most one encoded chunk exists beside the shared source.

use crate::measurements::TransferSession;
use crate::protocol::{write_chunk, write_end, Chunk};
use crate::source::{chunk_ranges, DataSource, Dataset, Table};
use crate::{Error, Result};
use log::debug;
use tokio::io::AsyncWrite;

/// Writes one chunk frame and counts it. Sequence indices start at 0 and
/// increase by one per chunk.
async fn send_chunk<W: AsyncWrite + Unpin>(
    writer: &mut W,
    session: &mut TransferSession,
    payload: &[u8],
) -> Result<()> {
    let chunk = Chunk {
        sequence_index: session.chunk_count,
        payload,
    };
    write_chunk(writer, &chunk).await?;
    session.record_chunk(payload.len());
    Ok(())
}

async fn finish<W: AsyncWrite + Unpin>(
    writer: &mut W,
    session: TransferSession,
) -> Result<TransferSession> {
    write_end(writer, session.chunk_count, session.bytes_so_far).await?;
    debug!(
        "Streamed {} chunks, {} bytes in {:?}",
        session.chunk_count,
        session.bytes_so_far,
        session.elapsed()
    );
    Ok(session)
}

/// Streams `source` in `chunk_size` slices borrowed straight from it,
/// followed by the end frame.
///
/// The first failed write aborts the transfer; nothing is retried.
pub async fn stream_source<W, S>(
    writer: &mut W,
    source: &S,
    chunk_size: usize,
) -> Result<TransferSession>
where
    W: AsyncWrite + Unpin,
    S: DataSource + ?Sized,
{
    if chunk_size == 0 {
        return Err(Error::Config("Chunk size must be at least 1 byte".to_string()));
    }
    let mut session = TransferSession::start();
    for range in chunk_ranges(source.total_size(), chunk_size) {
        let payload = source.read_range(range.start, (range.end - range.start) as usize);
        send_chunk(writer, &mut session, payload).await?;
    }
    finish(writer, session).await
}

/// Streams `table` as encoded record batches of at most `batch_rows` rows,
/// followed by the end frame. Each batch is encoded only once the previous
/// one has been written.
pub async fn stream_table<W: AsyncWrite + Unpin>(
    writer: &mut W,
    table: &Table,
    batch_rows: usize,
) -> Result<TransferSession> {
    if batch_rows == 0 {
        return Err(Error::Config("Batch rows must be at least 1".to_string()));
    }
    let mut session = TransferSession::start();
    for range in chunk_ranges(table.num_rows() as u64, batch_rows) {
        let encoded = table
            .batch(range.start as usize..range.end as usize)
            .encode()?;
        send_chunk(writer, &mut session, &encoded).await?;
    }
    finish(writer, session).await
}

/// Streams a whole dataset: a blob in `chunk_size` slices, a table in
/// record batches of `batch_rows` rows.
///
/// # Errors
///
/// Returns [`Error::Config`] when the relevant stride is zero, and the
/// first transport error otherwise.
pub async fn serve_dataset<W: AsyncWrite + Unpin>(
    writer: &mut W,
    dataset: &Dataset,
    chunk_size: usize,
    batch_rows: usize,
) -> Result<TransferSession> {
    match dataset {
        Dataset::Blob(blob) => stream_source(writer, blob, chunk_size).await,
        Dataset::Table(table) => stream_table(writer, table, batch_rows).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferPhase;
    use crate::protocol::{read_frame, Frame};
    use crate::source::{decode_batch_shape, BlobSource, Table};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    async fn collect_frames(wire: &[u8]) -> Vec<(Frame, Vec<u8>)> {
        let mut reader = wire;
        let mut frames = Vec::new();
        loop {
            let mut buf = Vec::new();
            let frame = read_frame(&mut reader, &mut buf).await.unwrap();
            let done = matches!(frame, Frame::End { .. });
            frames.push((frame, buf));
            if done {
                return frames;
            }
        }
    }

    /// Writer that accepts a fixed number of bytes and then fails.
    struct BrokenPipe {
        remaining: usize,
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_ten_bytes_in_chunks_of_four() {
        let dataset = Dataset::Blob(BlobSource::from_vec((0u8..10).collect()));
        let mut wire = Vec::new();
        let session = serve_dataset(&mut wire, &dataset, 4, 1).await.unwrap();
        assert_eq!(session.chunk_count, 3);
        assert_eq!(session.bytes_so_far, 10);

        let frames = collect_frames(&wire).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].0, Frame::Chunk { sequence_index: 0, len: 4 });
        assert_eq!(frames[1].0, Frame::Chunk { sequence_index: 1, len: 4 });
        assert_eq!(frames[2].0, Frame::Chunk { sequence_index: 2, len: 2 });
        assert_eq!(frames[2].1, vec![8, 9]);
        assert_eq!(frames[3].0, Frame::End { chunks: 3, total_bytes: 10 });
    }

    #[tokio::test]
    async fn test_empty_blob_sends_only_end() {
        let dataset = Dataset::Blob(BlobSource::from_vec(Vec::new()));
        let mut wire = Vec::new();
        let session = serve_dataset(&mut wire, &dataset, 4, 1).await.unwrap();
        assert_eq!(session.chunk_count, 0);

        let frames = collect_frames(&wire).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, Frame::End { chunks: 0, total_bytes: 0 });
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let dataset = Dataset::Blob(BlobSource::from_vec(vec![1, 2, 3]));
        let mut wire = Vec::new();
        let result = serve_dataset(&mut wire, &dataset, 0, 1).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_table_streams_record_batches() {
        let dataset = Dataset::Table(Table::sequence(10).unwrap());
        let mut wire = Vec::new();
        let session = serve_dataset(&mut wire, &dataset, 1, 4).await.unwrap();
        assert_eq!(session.chunk_count, 3);

        let frames = collect_frames(&wire).await;
        let rows: Vec<usize> = frames[..3]
            .iter()
            .map(|(_, payload)| decode_batch_shape(payload).unwrap().rows)
            .collect();
        assert_eq!(rows, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_transfer_runs_on_spawned_task() {
        let dataset = std::sync::Arc::new(Dataset::Table(Table::sequence(10).unwrap()));
        let (mut server, mut client) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            let session = serve_dataset(&mut server, &dataset, 4, 3).await?;
            let blob = Dataset::Blob(BlobSource::from_vec(vec![7; 10]));
            serve_dataset(&mut server, &blob, 4, 3).await?;
            Ok::<_, Error>(session.chunk_count)
        });

        let mut wire = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut wire).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 4);

        let frames = collect_frames(&wire).await;
        assert_eq!(frames.len(), 5);
    }

    #[tokio::test]
    async fn test_send_failure_aborts() {
        let dataset = Dataset::Blob(BlobSource::from_vec(vec![0u8; 64]));
        let mut writer = BrokenPipe { remaining: 20 };
        let result = serve_dataset(&mut writer, &dataset, 16, 1).await;
        assert!(matches!(
            result,
            Err(Error::Transport {
                phase: TransferPhase::Send,
                ..
            })
        ));
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: chunks cover the blob exactly, in order, without gaps
            #[test]
            fn prop_chunks_cover_blob(size in 0usize..4096, chunk_size in 1usize..512) {
                let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
                let dataset = Dataset::Blob(BlobSource::from_vec(data.clone()));
                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

                let frames = runtime.block_on(async {
                    let mut wire = Vec::new();
                    serve_dataset(&mut wire, &dataset, chunk_size, 1).await.unwrap();
                    collect_frames(&wire).await
                });

                let expected_chunks = size.div_ceil(chunk_size);
                prop_assert_eq!(frames.len(), expected_chunks + 1);

                let mut received = Vec::new();
                for (i, (frame, payload)) in frames[..expected_chunks].iter().enumerate() {
                    match frame {
                        Frame::Chunk { sequence_index, len } => {
                            prop_assert_eq!(*sequence_index, i as u64);
                            if i + 1 < expected_chunks {
                                prop_assert_eq!(*len, chunk_size);
                            } else {
                                prop_assert!(*len > 0 && *len <= chunk_size);
                            }
                        }
                        other => prop_assert!(false, "unexpected frame {:?}", other),
                    }
                    received.extend_from_slice(payload);
                }
                prop_assert_eq!(received, data);
            }
        }
    }
}
