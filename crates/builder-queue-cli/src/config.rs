use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use builder_queue::{
    HttpBackend, HttpBackendConfig, PoolConfig, ProvisioningBackend, ServerConfig, StaticBackend,
};
use clap::{Parser, ValueEnum};

/// Runtime configuration for the `builder-queue` server.
///
/// Every option can also be set through its `BUILDER_QUEUE_*` environment
/// variable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "builder-queue",
    version,
    about = "Hands out short-lived container builders to build clients"
)]
pub struct QueueArgs {
    /// Address to listen on.
    #[arg(long, env = "BUILDER_QUEUE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "BUILDER_QUEUE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding per-request build directories.
    ///
    /// Defaults to `builder-queue` under the system temp directory.
    #[arg(long, env = "BUILDER_QUEUE_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Upper bound on builders in existence, active plus reserve plus those
    /// being created.
    #[arg(long, env = "BUILDER_QUEUE_MAX_BUILDERS", default_value_t = 1)]
    pub max_builders: usize,

    /// Number of idle builders to keep ready.
    #[arg(long, env = "BUILDER_QUEUE_MAX_RESERVE_BUILDERS", default_value_t = 1)]
    pub max_reserve_builders: usize,

    /// Seconds to wait before retrying a failed backend call.
    #[arg(long, env = "BUILDER_QUEUE_RETRY_DELAY_SECS", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Where builders come from.
    #[arg(long, env = "BUILDER_QUEUE_BACKEND", value_enum, default_value_t = BackendKind::Static)]
    pub backend: BackendKind,

    /// Base URL of the provisioning service (`--backend http`).
    #[arg(long, env = "BUILDER_QUEUE_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Bearer token for the provisioning service.
    #[arg(long, env = "BUILDER_QUEUE_BACKEND_TOKEN", hide_env_values = true)]
    pub backend_token: Option<String>,

    /// Provisioning request timeout in seconds.
    #[arg(long, env = "BUILDER_QUEUE_BACKEND_TIMEOUT_SECS", default_value_t = 30)]
    pub backend_timeout_secs: u64,

    /// Host every builder points at (`--backend static`).
    #[arg(long, env = "BUILDER_QUEUE_STATIC_HOST", default_value = "127.0.0.1")]
    pub static_host: String,

    /// Port every builder points at (`--backend static`).
    #[arg(long, env = "BUILDER_QUEUE_STATIC_PORT", default_value_t = 22)]
    pub static_port: u16,

    /// Build command; the definition and image paths are appended.
    #[arg(
        long,
        env = "BUILDER_QUEUE_BUILD_COMMAND",
        value_delimiter = ' ',
        num_args = 1..,
        default_values = ["singularity", "build"]
    )]
    pub build_command: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Fixed host, no provisioning.
    Static,
    /// REST provisioning service.
    Http,
}

#[derive(Debug, Clone)]
pub enum BackendSettings {
    Static { host: String, port: u16 },
    Http(HttpBackendConfig),
}

impl BackendSettings {
    pub fn into_backend(self) -> anyhow::Result<Arc<dyn ProvisioningBackend>> {
        Ok(match self {
            BackendSettings::Static { host, port } => Arc::new(StaticBackend::new(host, port)),
            BackendSettings::Http(config) => {
                Arc::new(HttpBackend::new(config).context("failed to build HTTP backend")?)
            }
        })
    }
}

/// Validated settings for one server process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub backend: BackendSettings,
    pub build_program: String,
    pub build_args: Vec<String>,
}

impl TryFrom<QueueArgs> for Settings {
    type Error = anyhow::Error;

    fn try_from(args: QueueArgs) -> Result<Self, Self::Error> {
        let pool = PoolConfig::new()
            .with_max_builders(args.max_builders)
            .with_max_reserve_builders(args.max_reserve_builders)
            .with_retry_delay(Duration::from_secs(args.retry_delay_secs));
        pool.validate().context("invalid pool configuration")?;

        let backend = match args.backend {
            BackendKind::Static => BackendSettings::Static {
                host: args.static_host,
                port: args.static_port,
            },
            BackendKind::Http => {
                let Some(url) = args.backend_url else {
                    bail!("BUILDER_QUEUE_BACKEND_URL is required for the http backend");
                };
                let mut config = HttpBackendConfig::new(url)
                    .with_timeout(Duration::from_secs(args.backend_timeout_secs));
                if let Some(token) = args.backend_token {
                    config = config.with_token(token);
                }
                BackendSettings::Http(config)
            }
        };

        let mut command = args.build_command.into_iter().filter(|s| !s.is_empty());
        let Some(build_program) = command.next() else {
            bail!("BUILDER_QUEUE_BUILD_COMMAND must name a program");
        };

        let mut server = ServerConfig {
            host: args.host,
            port: args.port,
            ..ServerConfig::default()
        };
        if let Some(work_dir) = args.work_dir {
            server.work_dir = work_dir;
        }

        Ok(Self {
            server,
            pool,
            backend,
            build_program,
            build_args: command.collect(),
        })
    }
}
