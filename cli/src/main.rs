//! `lineas` - bulk phone-line registry harvester.

use anyhow::{Context, Result};
use clap::Parser;
use lineas_browser::ChromiumBackend;
use lineas_core::HarvestConfig;
use lineas_harvester::{Orchestrator, StopReason};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "lineas", version, about = "Harvest registered phone lines for a list of RUCs")]
struct Cli {
    /// CSV with a RUC column; rewritten to the pending keys at every checkpoint
    input: PathBuf,

    /// Bandwidth cap in MB
    #[arg(long, value_name = "MB")]
    bandwidth: Option<u64>,

    /// Output directory
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Upper bound on concurrent browser sessions
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Config file (defaults to the XDG location)
    #[arg(long, value_name = "PATH", env = "LINEAS_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging for lineas crates
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut HarvestConfig) {
        if let Some(mb) = self.bandwidth {
            config.bandwidth.cap_mb = mb;
            config.bandwidth.cap_bytes_override = None;
        }
        if let Some(dir) = &self.output {
            config.output.dir.clone_from(dir);
        }
        if let Some(workers) = self.workers {
            config.harvest.max_workers = Some(workers);
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose { "info,lineas=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn exit_code(reason: StopReason) -> ExitCode {
    match reason {
        StopReason::Completed => ExitCode::SUCCESS,
        StopReason::BandwidthExhausted | StopReason::ProxyExhausted => ExitCode::from(3),
        StopReason::Interrupted => ExitCode::from(130),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("Starting lineas v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HarvestConfig::load_with_env(cli.config.as_deref())
        .context("failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;
    if !config.proxy.is_configured() {
        tracing::warn!("No proxy credentials configured, lookups will use the host's own IP");
    }
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, finishing in-flight lookups");
                on_signal.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let backend = Arc::new(ChromiumBackend::new(&config).context("failed to set up browser backend")?);
    let summary = Orchestrator::new(Arc::clone(&config), backend)
        .run(&cli.input, shutdown)
        .await
        .with_context(|| format!("run over {} failed", cli.input.display()))?;

    info!(
        reason = %summary.stop_reason,
        succeeded = summary.counts.succeeded,
        failed = summary.counts.failed,
        remaining = summary.counts.pending + summary.counts.in_progress,
        skipped = summary.skipped_known,
        rejected = summary.rejected,
        checkpoint = summary.generation,
        "Harvest stopped"
    );
    if summary.stop_reason != StopReason::Completed {
        info!(
            "Re-run with the same input to continue: {}",
            cli.input.display()
        );
    }

    Ok(exit_code(summary.stop_reason))
}
