//! Blocking client for the builder-queue wire protocol.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use builder_queue::transfer::blocking;
use builder_queue::{Command, TransferError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to builder queue: {0}")]
    Connect(#[source] io::Error),
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to send definition: {0}")]
    Upload(#[source] TransferError),
    #[error("build failed, no image was returned: {0}")]
    Download(#[source] TransferError),
    #[error("builder queue refused the request: {0}")]
    Refused(String),
}

fn connect(addr: impl ToSocketAddrs, command: Command) -> Result<TcpStream, ClientError> {
    let mut stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
    stream.write_all(format!("{command}\n").as_bytes())?;
    tracing::debug!(command = %command, "Sent command");
    Ok(stream)
}

/// Send `definition` for building and write the result to `image`.
///
/// Blocks until the build finishes; there is no timeout. On failure no file
/// is left at `image`. Returns the image size.
pub fn request_build(
    addr: impl ToSocketAddrs,
    definition: &Path,
    image: &Path,
) -> Result<u64, ClientError> {
    let mut stream = connect(addr, Command::BuildRequest)?;

    let sent = blocking::send_file(&mut stream, definition).map_err(ClientError::Upload)?;
    tracing::info!(bytes = sent, "Sent definition, waiting for build");

    match blocking::receive_file(&mut stream, image) {
        Ok(received) => {
            tracing::info!(bytes = received, image = %image.display(), "Received image");
            Ok(received)
        }
        Err(e) => {
            let _ = std::fs::remove_file(image);
            Err(ClientError::Download(e))
        }
    }
}

/// Fetch the pool status document.
pub fn request_status(addr: impl ToSocketAddrs) -> Result<String, ClientError> {
    let mut stream = connect(addr, Command::DiagnosticRequest)?;

    let mut body = String::new();
    stream.read_to_string(&mut body)?;
    if let Some(reason) = body.strip_prefix("error: ") {
        return Err(ClientError::Refused(reason.trim_end().to_string()));
    }
    Ok(body)
}
