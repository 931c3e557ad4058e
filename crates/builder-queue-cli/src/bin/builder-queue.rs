use std::sync::Arc;

use builder_queue::{BuilderPool, CommandExecutor, Server};
use builder_queue_cli::config::{QueueArgs, Settings};
use builder_queue_cli::logging::init_tracing;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = Settings::try_from(QueueArgs::parse())?;
    tracing::info!(version = builder_queue::BUILDER_QUEUE_VERSION, "Starting builder-queue");

    let backend = settings.backend.into_backend()?;
    let pool = BuilderPool::start(settings.pool, backend)?;
    let executor =
        Arc::new(CommandExecutor::new(settings.build_program).with_args(settings.build_args));

    let server = Server::bind(settings.server, pool, executor).await?;
    builder_queue::serve(server).await?;
    Ok(())
}
