//! tierloop CLI: the main entry point.
//!
//! Commands:
//! - `run`     : Run one conversation through the execution loop
//! - `check`   : Validate a config and print the resolved tier plan
//! - `extract` : Run the tool-call extractor on a piece of text

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierloop_core::DispatchStrategy;

mod commands;

#[derive(Parser)]
#[command(
    name = "tierloop",
    about = "tierloop: tool-calling execution engine over tiered LLM providers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single message through the execution loop
    Run {
        /// Path to the engine config
        #[arg(short, long, env = "TIERLOOP_CONFIG", default_value = "tierloop.toml")]
        config: PathBuf,

        /// The user message
        #[arg(short, long)]
        message: String,

        /// Override the dispatch strategy (sequential, racing, adaptive)
        #[arg(long)]
        strategy: Option<DispatchStrategy>,

        /// Override the step limit
        #[arg(long)]
        max_steps: Option<u32>,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a config and print the tier plan
    Check {
        #[arg(short, long, env = "TIERLOOP_CONFIG", default_value = "tierloop.toml")]
        config: PathBuf,
    },

    /// Extract tool calls from text (stdin when --text is absent)
    Extract {
        #[arg(short, long)]
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Run {
            config,
            message,
            strategy,
            max_steps,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                config,
                message,
                strategy,
                max_steps,
                json,
            })
            .await
        }
        Commands::Check { config } => commands::check::run(&config),
        Commands::Extract { text } => commands::extract::run(text),
    }
}
