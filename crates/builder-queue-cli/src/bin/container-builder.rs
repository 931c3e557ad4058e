use std::path::PathBuf;

use anyhow::Context;
use builder_queue_cli::client;
use builder_queue_cli::logging::init_tracing;
use clap::{Parser, Subcommand};

/// Build a container image remotely through a builder queue.
#[derive(Parser, Debug)]
#[command(name = "container-builder", version)]
struct Cli {
    /// Builder queue address.
    #[arg(long, env = "BUILDER_QUEUE_ADDR", default_value = "127.0.0.1:8080", global = true)]
    addr: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Send a definition and save the built image.
    Build {
        /// Container definition file.
        definition: PathBuf,
        /// Where to write the image.
        image: PathBuf,
    },
    /// Print the queue's active and reserve builders.
    Status,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Cmd::Build { definition, image } => {
            let bytes = client::request_build(cli.addr.as_str(), &definition, &image)
                .with_context(|| format!("failed to build {}", definition.display()))?;
            println!("{} ({} bytes)", image.display(), bytes);
        }
        Cmd::Status => {
            let status = client::request_status(cli.addr.as_str())?;
            print!("{status}");
        }
    }
    Ok(())
}
