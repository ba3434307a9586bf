mod commands;
mod logging;
mod processors;
mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "baton",
    version,
    about = "Staged pipeline workers over a durable broker"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a pipeline in this process
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// JSON object to submit through the ingress (repeatable)
        #[arg(long = "submit", value_name = "JSON")]
        submit: Vec<String>,
        /// Exit once every submitted document has reached a terminal stage
        #[arg(long)]
        until_done: bool,
    },
    /// Validate pipeline configuration and declare its topology
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            submit,
            until_done,
        } => commands::run::execute(&pipeline, &submit, until_done).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
    }
}
