use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use parrotty::agent::Agent;
use parrotty::config::Config;

/// Captures host terminal activity with kernel probes.
#[derive(Parser)]
#[command(
    name = "parrotty",
    about,
    after_help = "Logs are written to stderr. Redirect both stdout and stderr away from \
                  any terminal being traced, or their output is captured again."
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Event output file, or "-" for stdout. Overrides `output.path`.
    #[arg(short, long)]
    output: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("parrotty {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(output) = cli.output {
        cfg.output.path = output;
    }
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }
    cfg.validate()?;

    // Diagnostics go to stderr so they never mix with events on stdout.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting parrotty",
    );
    if let Some(msg) = stderr_feedback_warning(std::io::stderr().is_terminal()) {
        tracing::warn!("{msg}");
    }

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// Log lines written to a terminal are themselves terminal output and get
/// traced again.
fn stderr_feedback_warning(stderr_is_terminal: bool) -> Option<&'static str> {
    stderr_is_terminal.then_some(
        "stderr is a terminal: log lines written there will be captured as tty events; \
         redirect stderr to a file",
    )
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    let cancel = agent.cancel_token();

    // Set up signal handling.
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });

    let result = agent.run().await;

    // Graceful shutdown.
    agent.stop().await?;

    let summary = result?;
    tracing::info!(
        events = summary.events,
        recalibrations = summary.recalibrations,
        dropped = ?summary.dropped,
        "parrotty stopped"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_feedback_warning() {
        let msg = stderr_feedback_warning(true).unwrap();
        assert!(msg.contains("redirect stderr"));
        assert!(stderr_feedback_warning(false).is_none());
    }

    #[test]
    fn test_help_mentions_stderr_redirect() {
        use clap::CommandFactory;
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("stderr"));
    }
}
