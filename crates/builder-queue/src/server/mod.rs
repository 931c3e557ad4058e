//! TCP front end for container builds.
//!
//! Each connection opens with a command line. `build_request` is followed by a
//! definition frame from the client; the server checks out a builder, runs the
//! build and answers with an image frame. `diagnostic_request` is answered
//! with the pool status as JSON. Anything else is refused and the connection
//! closed.

mod command;
mod connection;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::executor::{BuildError, BuildExecutor};
use crate::pool::{BuilderPool, PoolError};
use crate::transfer::TransferError;

pub use command::{Command, UnknownCommand};
pub use connection::MAX_COMMAND_LEN;
use connection::Dispatcher;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommand),
    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode status: {0}")]
    Status(#[from] serde_json::Error),
    #[error("server is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Parent of the per-request build directories.
    pub work_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            work_dir: std::env::temp_dir().join("builder-queue"),
        }
    }
}

/// Pause after a failed accept, so a persistent error such as EMFILE does not
/// spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Bind the listener and prepare the work directory.
    pub async fn bind(
        config: ServerConfig,
        pool: BuilderPool,
        executor: Arc<dyn BuildExecutor>,
    ) -> io::Result<Self> {
        tokio::fs::create_dir_all(&config.work_dir).await?;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher {
                pool,
                executor,
                work_dir: config.work_dir,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for in-flight
    /// connections to finish.
    ///
    /// Connections still waiting for a builder give up their checkout. If the
    /// builder pool stops, the server shuts down the same way and returns an
    /// error.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, work_dir = %self.dispatcher.work_dir.display(), "Listening");

        let tracker = TaskTracker::new();
        let mut pool_stopped = false;
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.dispatcher.pool.stopped() => {
                    tracing::error!("Builder pool manager stopped, shutting down server");
                    pool_stopped = true;
                    shutdown.cancel();
                    break;
                }
                accepted = accept_with_backoff(|| self.listener.accept()) => accepted,
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("connection", %peer);
            tracker.spawn(tracing::Instrument::instrument(
                async move { dispatcher.handle(stream, shutdown).await },
                span,
            ));
        }

        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Waiting for connections to finish");
        tracker.wait().await;
        tracing::info!("Server shutdown complete");

        if pool_stopped {
            return Err(io::Error::other("builder pool manager stopped"));
        }
        Ok(())
    }
}

/// Call `accept` until it succeeds, pausing after every failure.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if the signal handlers cannot be installed, which only happens when
/// called outside a configured tokio runtime.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}

/// Run `server` until SIGINT or SIGTERM.
pub async fn serve(server: Server) -> io::Result<()> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    server.run(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::backend::StaticBackend;
    use crate::builder::BuilderHandle;
    use crate::pool::PoolConfig;
    use crate::status::PoolStatus;
    use crate::transfer;

    /// Image is the definition prefixed with the builder id.
    struct StampExecutor;

    #[async_trait]
    impl BuildExecutor for StampExecutor {
        async fn build(
            &self,
            builder: &BuilderHandle,
            definition: &Path,
            image: &Path,
        ) -> Result<(), BuildError> {
            let mut content = builder.id().as_bytes().to_vec();
            content.extend(tokio::fs::read(definition).await.map_err(BuildError::Spawn)?);
            tokio::fs::write(image, content).await.map_err(BuildError::Spawn)?;
            Ok(())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl BuildExecutor for FailingExecutor {
        async fn build(&self, _: &BuilderHandle, _: &Path, image: &Path) -> Result<(), BuildError> {
            Err(BuildError::MissingImage(image.to_path_buf()))
        }
    }

    struct Harness {
        addr: SocketAddr,
        pool: BuilderPool,
        work_dir: tempfile::TempDir,
        shutdown: CancellationToken,
        server: tokio::task::JoinHandle<io::Result<()>>,
    }

    impl Harness {
        async fn start(executor: Arc<dyn BuildExecutor>) -> Self {
            let pool = BuilderPool::start(
                PoolConfig::new()
                    .with_max_builders(2)
                    .with_max_reserve_builders(1),
                Arc::new(StaticBackend::new("10.0.0.9", 7000)),
            )
            .unwrap();

            let work_dir = tempfile::tempdir().unwrap();
            let config = ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                work_dir: work_dir.path().to_path_buf(),
            };
            let server = Server::bind(config, pool.clone(), executor).await.unwrap();
            let addr = server.local_addr().unwrap();

            let shutdown = CancellationToken::new();
            let server = tokio::spawn(server.run(shutdown.clone()));

            Self {
                addr,
                pool,
                work_dir,
                shutdown,
                server,
            }
        }

        async fn connect(&self, command: &str) -> TcpStream {
            let mut stream = TcpStream::connect(self.addr).await.unwrap();
            stream
                .write_all(format!("{command}\n").as_bytes())
                .await
                .unwrap();
            stream
        }

        async fn wait_for(&self, done: impl Fn(&PoolStatus) -> bool) -> PoolStatus {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let status = self.pool.status().await.unwrap();
                    if done(&status) {
                        return status;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("pool did not settle")
        }

        async fn assert_work_dir_empty(&self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while std::fs::read_dir(self.work_dir.path()).unwrap().next().is_some() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("build directory was not removed");
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn build_request_returns_image_and_builder() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;

        let mut stream = harness.connect("build_request").await;
        transfer::send(&mut stream, &mut Cursor::new(b"Bootstrap: docker".to_vec()))
            .await
            .unwrap();
        let mut image = Vec::new();
        transfer::receive(&mut stream, &mut image).await.unwrap();

        let image = String::from_utf8(image).unwrap();
        assert!(image.starts_with("static-"), "{image}");
        assert!(image.ends_with("Bootstrap: docker"), "{image}");

        let builder_id = image.trim_end_matches("Bootstrap: docker").to_string();
        let status = harness
            .wait_for(|s| s.active.is_empty() && s.reserve.len() == 1)
            .await;
        assert!(status.reserve.iter().all(|b| b.id() != builder_id));

        harness.assert_work_dir_empty().await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn diagnostic_request_reports_pool_json() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;
        harness.wait_for(|s| s.reserve.len() == 1).await;

        let mut stream = harness.connect("diagnostic_request").await;
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["active"], serde_json::json!([]));
        let reserve = json["reserve"].as_array().unwrap();
        assert_eq!(reserve.len(), 1);
        assert_eq!(reserve[0]["host"], "10.0.0.9");
        assert_eq!(reserve[0]["port"], 7000);

        harness.stop().await;
    }

    #[tokio::test]
    async fn unknown_command_is_refused() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;

        let mut stream = harness.connect("shell").await;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, connection::PERMISSION_DENIED);

        harness.stop().await;
    }

    #[tokio::test]
    async fn failed_build_still_returns_builder() {
        let harness = Harness::start(Arc::new(FailingExecutor)).await;

        let mut stream = harness.connect("build_request").await;
        transfer::send(&mut stream, &mut Cursor::new(b"def".to_vec()))
            .await
            .unwrap();

        // No image frame: the server closes without a header.
        let mut image = Vec::new();
        assert!(transfer::receive(&mut stream, &mut image).await.is_err());

        harness
            .wait_for(|s| s.active.is_empty() && s.reserve.len() == 1)
            .await;
        harness.assert_work_dir_empty().await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn client_disconnect_mid_transfer_returns_builder() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;

        let mut stream = harness.connect("build_request").await;
        stream.write_all(&1_000u64.to_be_bytes()).await.unwrap();
        stream.write_all(&[0u8; 10]).await.unwrap();
        drop(stream);

        harness
            .wait_for(|s| s.active.is_empty() && s.reserve.len() == 1)
            .await;
        harness.assert_work_dir_empty().await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_withdraws_waiting_checkouts() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;

        // Hold both builders the pool may create.
        let first = harness.pool.acquire().await.unwrap();
        let second = harness.pool.acquire().await.unwrap();

        let mut stream = harness.connect("build_request").await;
        harness.wait_for(|s| s.pending == 1).await;

        harness.shutdown.cancel();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        harness.server.await.unwrap().unwrap();
        let status = harness.pool.status().await.unwrap();
        assert_eq!(status.pending, 0);

        harness.pool.return_builder(first);
        harness.pool.return_builder(second);
    }

    #[tokio::test]
    async fn server_stops_when_pool_manager_dies() {
        let harness = Harness::start(Arc::new(StampExecutor)).await;

        let builder = harness.pool.acquire().await.unwrap();
        harness.pool.return_builder(builder.clone());
        harness.pool.return_builder(builder);

        let result = tokio::time::timeout(Duration::from_secs(5), harness.server)
            .await
            .expect("server kept running after the pool stopped")
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("builder pool"), "{err}");
        assert!(harness.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_pause_before_retrying() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let counter = &attempts;
        let start = tokio::time::Instant::now();

        let accepted = accept_with_backoff(move || async move {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 3 {
                Err(io::Error::from_raw_os_error(24))
            } else {
                Ok("stream")
            }
        })
        .await;

        assert_eq!(accepted, "stream");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert!(start.elapsed() >= 3 * ACCEPT_ERROR_BACKOFF);
    }
}
