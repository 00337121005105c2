//! `exposed`: CCD exposure control daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ccd_exposed::config::DEFAULT_CONFIG_PATH;
use ccd_exposed::{Daemon, ExposedConfig};

/// CCD exposure control daemon
#[derive(Parser, Debug)]
#[command(name = "exposed", version, author, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let mut config = ExposedConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.exposed.listen = listen;
        config.validate()?;
    }

    if args.print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let pid_file = config.exposed.pid_file.clone();
    let daemon = Daemon::start(config).await.context("starting daemon")?;
    if let Some(path) = &pid_file {
        write_pid(path).await;
    }

    info!(addr = %daemon.local_addr(), "ready for requests");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");

    daemon.shutdown().await;
    if let Some(path) = &pid_file {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "could not remove pid file");
        }
    }
    Ok(())
}

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn write_pid(path: &Path) {
    let pid = std::process::id();
    match tokio::fs::write(path, format!("{pid}\n")).await {
        Ok(()) => info!(path = %path.display(), pid, "pid file written"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not write pid file"),
    }
}
