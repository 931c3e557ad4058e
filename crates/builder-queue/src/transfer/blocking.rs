//! Blocking form of the transfer protocol, for callers without a runtime.
//!
//! Same wire format and chunking as the async functions in the parent module.

use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use super::{CHUNK_SIZE, HEADER_LEN, TransferError, chunk_len};

pub fn send<W, R>(stream: &mut W, file: &mut R) -> Result<u64, TransferError>
where
    W: Write,
    R: Read + Seek,
{
    let expected = file.seek(io::SeekFrom::End(0))?;
    file.seek(io::SeekFrom::Start(0))?;
    stream.write_all(&expected.to_be_bytes())?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < expected {
        let want = chunk_len(expected - sent);
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => return Err(TransferError::SourceTruncated { sent, expected }),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        stream.write_all(&buf[..n])?;
        sent += n as u64;
    }
    stream.flush()?;
    Ok(sent)
}

pub fn receive<R, W>(stream: &mut R, file: &mut W) -> Result<u64, TransferError>
where
    R: Read,
    W: Write,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let expected = u64::from_be_bytes(header);

    let mut buf = vec![0u8; chunk_len(expected)];
    let mut received = 0u64;
    while received < expected {
        let want = chunk_len(expected - received);
        let n = match stream.read(&mut buf[..want]) {
            Ok(0) => return Err(TransferError::StreamTruncated { received, expected }),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&buf[..n])?;
        received += n as u64;
    }
    file.flush()?;
    Ok(received)
}

pub fn send_file<W: Write>(stream: &mut W, path: &Path) -> Result<u64, TransferError> {
    let mut file = File::open(path)?;
    send(stream, &mut file)
}

pub fn receive_file<R: Read>(stream: &mut R, path: &Path) -> Result<u64, TransferError> {
    let mut file = File::create(path)?;
    let n = receive(stream, &mut file)?;
    file.sync_all()?;
    Ok(n)
}
