//! Tether CLI - run newline-delimited messages through a supervised subprocess.

mod check;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_core::Codec;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run messages through a supervised subprocess")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send each input line through the subprocess and print the answers
    Run {
        /// Step config file (.toml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Read messages from a file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Number of messages per batch
        #[arg(short, long, default_value = "1")]
        batch_size: usize,

        /// Framing of requests (lines, length_prefixed_uint32_be, netstring)
        #[arg(long)]
        codec_send: Option<Codec>,

        /// Framing of responses (lines, length_prefixed_uint32_be, netstring)
        #[arg(long)]
        codec_recv: Option<Codec>,

        /// Only process these part indices of each batch (negative counts from the end)
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        parts: Vec<isize>,

        /// Maximum size of a response frame in bytes
        #[arg(long)]
        max_buffer: Option<usize>,

        /// Seconds to wait for the subprocess to shut down
        #[arg(long, default_value = "5")]
        close_timeout: u64,

        /// Exit with an error if any message failed
        #[arg(long)]
        fail_on_error: bool,

        /// Command and arguments to run (overrides the config file)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Validate a step config file
    Check {
        /// Path to the config file (.toml or .json)
        config: PathBuf,

        /// Print the resolved config as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format tether-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tether_err) = err.downcast_ref::<tether_core::Error>() {
            anyhow::anyhow!("{}", tether_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            config,
            input,
            batch_size,
            codec_send,
            codec_recv,
            parts,
            max_buffer,
            close_timeout,
            fail_on_error,
            command,
        } => {
            let options = run::RunOptions {
                config,
                input,
                batch_size,
                codec_send,
                codec_recv,
                parts,
                max_buffer,
                close_timeout: std::time::Duration::from_secs(close_timeout),
                fail_on_error,
                command,
            };
            if let run::Outcome::Interrupted = run::execute(options).await.map_err(format_error)? {
                std::process::exit(130);
            }
        }

        Commands::Check { config, json } => {
            check::execute(&config, json).map_err(format_error)?;
        }
    }

    Ok(())
}
