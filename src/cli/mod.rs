//! Command-line interface.
//!
//! ```text
//! convert2pdf serve                      run the ingress API (and file bridge)
//! convert2pdf batch -H host -i dir ...   convert a directory against a server
//! convert2pdf check -H host              connectivity test
//! convert2pdf types -H host              list supported types by family
//! ```

mod batch;
mod serve;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use crate::worker::WorkerBackend;

pub use batch::IndicatifProgress;

#[derive(Parser, Debug)]
#[command(
    name = "convert2pdf",
    version,
    about = "Convert office documents to PDF in disposable per-job workers"
)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the conversion server
    Serve(ServeArgs),

    /// Convert every supported file in a directory
    Batch(BatchArgs),

    /// Check that a server is reachable and healthy
    Check(ServerArgs),

    /// List the file types a server accepts
    Types(ServerArgs),
}

impl Command {
    /// Log filter used when `RUST_LOG` is unset. Batch runs draw a progress
    /// bar on stderr, so they only log warnings.
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Command::Serve(_) => "convert2pdf=info,tower_http=info",
            Command::Batch(_) => "convert2pdf=warn",
            Command::Check(_) | Command::Types(_) => "convert2pdf=info",
        }
    }
}

/// Overrides applied on top of the environment configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Address to bind the public API to
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Public API port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Internal file bridge port
    #[arg(long)]
    pub bridge_port: Option<u16>,

    /// Worker backend: subprocess or container
    #[arg(long)]
    pub backend: Option<WorkerBackend>,

    /// Root directory for per-job staging
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
}

/// Where the server is.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Server host
    #[arg(short = 'H', long, env = "CONVERT_SERVER_HOST", default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "CONVERT_SERVER_PORT", default_value_t = 7758)]
    pub port: u16,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Directory with files to convert
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory for the results report (default: parent of the input)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum concurrent conversions
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: u32,

    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Don't write the JSON report
    #[arg(long)]
    pub no_save_results: bool,

    /// Retries per file after the first attempt
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Base retry delay in seconds, doubled on each retry
    #[arg(long, default_value_t = 1.0)]
    pub retry_delay: f64,
}

/// Run the parsed command.
pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Serve(args) => {
            serve::run_serve(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch(args) => {
            let all_ok = batch::run_batch(args).await?;
            Ok(if all_ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Check(args) => batch::run_check(args).await,
        Command::Types(args) => {
            batch::run_types(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
