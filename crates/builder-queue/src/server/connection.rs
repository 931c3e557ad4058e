//! One client connection: read the command line, then serve it.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::DispatchError;
use super::command::Command;
use crate::executor::BuildExecutor;
use crate::pool::BuilderPool;
use crate::transfer;

/// Longest accepted command line, terminator included.
pub const MAX_COMMAND_LEN: usize = 256;

pub(crate) const PERMISSION_DENIED: &[u8] = b"error: permission denied: unrecognized command\n";

const DEFINITION_FILE: &str = "container.def";
const IMAGE_FILE: &str = "container.img";

/// What every connection needs from the server.
pub(super) struct Dispatcher {
    pub(super) pool: BuilderPool,
    pub(super) executor: Arc<dyn BuildExecutor>,
    pub(super) work_dir: PathBuf,
}

impl Dispatcher {
    pub(super) async fn handle(&self, stream: TcpStream, shutdown: CancellationToken) {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let mut stream = BufReader::new(stream);

        match self.dispatch(&mut stream, peer, local, &shutdown).await {
            Ok(command) => tracing::debug!(command = %command, "Connection finished"),
            Err(e @ (DispatchError::UnknownCommand(_) | DispatchError::MalformedCommand(_))) => {
                tracing::warn!(error = %e, "Rejecting connection");
                if let Err(write_err) = stream.write_all(PERMISSION_DENIED).await {
                    tracing::debug!(error = %write_err, "Failed to send rejection");
                }
            }
            Err(DispatchError::ShuttingDown) => {
                tracing::info!("Dropping connection during shutdown");
            }
            Err(e) => tracing::error!(error = %e, "Request failed"),
        }
        let _ = stream.shutdown().await;
    }

    async fn dispatch(
        &self,
        stream: &mut BufReader<TcpStream>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        shutdown: &CancellationToken,
    ) -> Result<Command, DispatchError> {
        let command = read_command(stream).await?;
        tracing::info!(command = %command, "Received command");

        match command {
            Command::BuildRequest => self.build_request(stream, peer, local, shutdown).await?,
            Command::DiagnosticRequest => self.diagnostic_request(stream).await?,
        }
        Ok(command)
    }

    async fn build_request(
        &self,
        stream: &mut BufReader<TcpStream>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        shutdown: &CancellationToken,
    ) -> Result<(), DispatchError> {
        // Dropping the checkout on shutdown withdraws it from the queue.
        let lease = tokio::select! {
            lease = self.pool.lease() => lease?,
            _ = shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
        };
        tracing::info!(builder_id = %lease.builder(), "Checked out builder");

        let dir = BuildDir::create(&self.work_dir, peer, local).await?;
        let definition = dir.path().join(DEFINITION_FILE);
        let image = dir.path().join(IMAGE_FILE);

        let received = transfer::receive_file(stream, &definition).await?;
        tracing::debug!(bytes = received, "Received definition");

        self.executor
            .build(lease.builder(), &definition, &image)
            .await?;

        let sent = transfer::send_file(stream, &image).await?;
        tracing::info!(builder_id = %lease.builder(), bytes = sent, "Sent image");
        Ok(())
    }

    async fn diagnostic_request(
        &self,
        stream: &mut BufReader<TcpStream>,
    ) -> Result<(), DispatchError> {
        let status = self.pool.status().await?;
        let mut body = status.to_json()?;
        body.push('\n');
        stream.write_all(body.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Read the command line, at most [`MAX_COMMAND_LEN`] bytes.
async fn read_command<R>(stream: &mut R) -> Result<Command, DispatchError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = stream
        .take(MAX_COMMAND_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(DispatchError::MalformedCommand("connection closed before command"));
    }
    if line.last() != Some(&b'\n') {
        return Err(DispatchError::MalformedCommand(if n == MAX_COMMAND_LEN {
            "command line too long"
        } else {
            "command line not terminated"
        }));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let line = std::str::from_utf8(&line)
        .map_err(|_| DispatchError::MalformedCommand("command is not utf-8"))?;
    Ok(line.parse()?)
}

/// Scratch directory for one build, removed on drop.
struct BuildDir {
    path: PathBuf,
}

impl BuildDir {
    async fn create(
        work_dir: &Path,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> io::Result<Self> {
        let path = work_dir.join(dir_name(peer, local));
        tokio::fs::create_dir_all(&path).await?;
        tracing::debug!(path = %path.display(), "Created build directory");
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove build directory")
            }
        }
    }
}

fn dir_name(peer: Option<SocketAddr>, local: Option<SocketAddr>) -> String {
    fn endpoint(addr: Option<SocketAddr>) -> String {
        match addr {
            Some(addr) => format!("{}_{}", addr.ip(), addr.port()).replace(':', "-"),
            None => "unknown".to_string(),
        }
    }
    format!(
        "{}-{}-{}",
        endpoint(peer),
        endpoint(local),
        uuid::Uuid::new_v4().simple()
    )
}
