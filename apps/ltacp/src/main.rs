//! ltacp entry point.

mod app;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Copy a remote file or directory into archive storage, verifying MD5 in
/// transit and Adler32 at rest.
#[derive(Parser, Debug)]
#[command(name = "ltacp", version)]
struct Cli {
    /// Configuration file (defaults to ~/.config/ltacp/ltacp.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,

    /// Source as `[user@]host:/path`.
    source: String,

    /// Destination storage URL.
    destination: String,
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only the result.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ltacp: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = config::AppConfig::load(cli.config.as_deref())?;
    tracing::debug!(
        mappings = config.url_table.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, &cli.source, &cli.destination, cli.json))
}
