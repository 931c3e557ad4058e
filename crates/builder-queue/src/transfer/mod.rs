//! Size-prefixed file transfer over a byte stream.
//!
//! Wire format: an 8-byte big-endian length header followed by exactly that
//! many content bytes. There is no trailer or checksum; the receiver stops
//! reading once the declared length is consumed, so the stream can carry
//! further frames.
//!
//! Content moves in chunks of at most [`CHUNK_SIZE`] bytes. A failed read or
//! write aborts the transfer; partial transfers are never resumed.

pub mod blocking;

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Largest slice of content read or written in one step.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the size header.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("source ended after {sent} of {expected} bytes")]
    SourceTruncated { sent: u64, expected: u64 },
    #[error("stream ended after {received} of {expected} bytes")]
    StreamTruncated { received: u64, expected: u64 },
}

/// Frame the whole of `file` onto `stream`. Returns the content length.
///
/// The length is taken by seeking `file` to its end; content is then sent
/// from the start.
pub async fn send<W, R>(stream: &mut W, file: &mut R) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + AsyncSeek + Unpin,
{
    let expected = file.seek(io::SeekFrom::End(0)).await?;
    file.seek(io::SeekFrom::Start(0)).await?;
    stream.write_u64(expected).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < expected {
        let want = chunk_len(expected - sent);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::SourceTruncated { sent, expected });
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    stream.flush().await?;

    tracing::trace!(bytes = sent, "Sent file frame");
    Ok(sent)
}

/// Read one frame from `stream` into `file`. Returns the content length.
///
/// Never reads past the declared length.
pub async fn receive<R, W>(stream: &mut R, file: &mut W) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let expected = stream.read_u64().await?;

    let mut buf = vec![0u8; chunk_len(expected)];
    let mut received = 0u64;
    while received < expected {
        let want = chunk_len(expected - received);
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::StreamTruncated { received, expected });
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    file.flush().await?;

    tracing::trace!(bytes = received, "Received file frame");
    Ok(received)
}

/// Send the file at `path`.
pub async fn send_file<W>(stream: &mut W, path: &Path) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    send(stream, &mut file).await
}

/// Receive one frame into a new file at `path`, truncating any existing one.
pub async fn receive_file<R>(stream: &mut R, path: &Path) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let n = receive(stream, &mut file).await?;
    file.sync_all().await?;
    Ok(n)
}

fn chunk_len(remaining: u64) -> usize {
    usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE))
}
