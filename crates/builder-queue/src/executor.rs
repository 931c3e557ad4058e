//! Running a container build on a checked-out builder.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::builder::BuilderHandle;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start build command: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed waiting for build command: {0}")]
    Wait(#[source] io::Error),
    #[error("build command failed: {0}")]
    Failed(ExitStatus),
    #[error("build produced no image at {}", .0.display())]
    MissingImage(PathBuf),
}

/// Turns a container definition into an image using one builder.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Build `definition` and leave the result at `image`.
    async fn build(
        &self,
        builder: &BuilderHandle,
        definition: &Path,
        image: &Path,
    ) -> Result<(), BuildError>;
}

/// Runs an external program as `<program> <args..> <definition> <image>`.
///
/// The builder is described to the program through `BUILDER_ID`,
/// `BUILDER_HOST` and `BUILDER_PORT`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }
}

#[async_trait]
impl BuildExecutor for CommandExecutor {
    async fn build(
        &self,
        builder: &BuilderHandle,
        definition: &Path,
        image: &Path,
    ) -> Result<(), BuildError> {
        tracing::info!(
            builder_id = %builder,
            program = ?self.program,
            definition = %definition.display(),
            "Starting build"
        );

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(definition)
            .arg(image)
            .env("BUILDER_ID", builder.id())
            .env("BUILDER_HOST", builder.host())
            .env("BUILDER_PORT", builder.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BuildError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, _, _) = tokio::join!(
            child.wait(),
            relay_lines(stdout, builder, OutputStream::Stdout),
            relay_lines(stderr, builder, OutputStream::Stderr),
        );
        let status = status.map_err(BuildError::Wait)?;

        if !status.success() {
            return Err(BuildError::Failed(status));
        }
        if !tokio::fs::try_exists(image).await.unwrap_or(false) {
            return Err(BuildError::MissingImage(image.to_path_buf()));
        }

        tracing::info!(builder_id = %builder, "Build finished");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Log each line of build output as it arrives. Returns the line count.
async fn relay_lines<R>(stream: Option<R>, builder: &BuilderHandle, kind: OutputStream) -> usize
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return 0;
    };
    let mut lines = BufReader::new(stream).lines();
    let mut count = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                match kind {
                    OutputStream::Stdout => {
                        tracing::info!(target: "builder_queue::build", builder_id = %builder, "{}", line)
                    }
                    OutputStream::Stderr => {
                        tracing::warn!(target: "builder_queue::build", builder_id = %builder, "{}", line)
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(builder_id = %builder, stream = ?kind, error = %e, "Stopped reading build output");
                break;
            }
        }
    }
    count
}
