//! minit - container init and unit supervisor.

use anyhow::Context;
use clap::Parser;
use minit::config::{self, InitConfig};
use minit::env;
use minit::loader::{self, LoadOptions};
use minit::Init;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "minit",
    about = "Minimal init process for containers",
    version
)]
struct Cli {
    /// Directory containing unit files
    #[arg(long, env = "MINIT_UNIT_DIR", default_value = "/etc/minit.d")]
    unit_dir: PathBuf,

    /// Directory for log files, "none" logs to console only
    #[arg(long, env = "MINIT_LOG_DIR", default_value = "/var/log/minit")]
    log_dir: String,

    /// Exit after short units when there are no long units
    #[arg(long, env = "MINIT_QUICK_EXIT")]
    quick_exit: bool,

    /// Delay before a daemon is restarted
    #[arg(long, env = "MINIT_RESTART_DELAY", default_value = "5s", value_parser = config::parse_duration)]
    restart_delay: Duration,

    /// Delay between cancellation and forwarding the signal to children
    #[arg(long, env = "MINIT_SHUTDOWN_GRACE", default_value = "3s", value_parser = config::parse_duration)]
    shutdown_grace: Duration,

    /// Maximum size of a log file before rotation
    #[arg(long, env = "MINIT_LOG_MAX_SIZE", default_value_t = config::DEFAULT_LOG_MAX_SIZE)]
    log_max_size: u64,

    /// Maximum count of rotated log files
    #[arg(long, env = "MINIT_LOG_MAX_COUNT", default_value_t = config::DEFAULT_LOG_MAX_COUNT)]
    log_max_count: u64,

    /// Only run these units, comma separated names, @group or &kind
    #[arg(long, env = "MINIT_ENABLE", default_value = "")]
    enable: String,

    /// Skip these units, comma separated names, @group or &kind
    #[arg(long, env = "MINIT_DISABLE", default_value = "")]
    disable: String,

    /// Run COMMAND once instead of as a daemon
    #[arg(long)]
    once: bool,

    /// Command to run as the `arg-main` unit
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn config(&self) -> InitConfig {
        InitConfig {
            unit_dir: self.unit_dir.clone(),
            log_dir: config::parse_log_dir(&self.log_dir),
            quick_exit: self.quick_exit,
            restart_delay: self.restart_delay,
            shutdown_grace: self.shutdown_grace,
            log_max_size: self.log_max_size,
            log_max_count: self.log_max_count,
            enable: self.enable.clone(),
            disable: self.disable.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("minit: exited with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config();
    let init = Init::new(config.clone()).context("failed to initialize")?;

    let (units, skipped) = loader::load(&LoadOptions {
        dir: Some(config.unit_dir.clone()),
        args: cli.command,
        once: cli.once,
        env: env::environ(),
        enable: config.enable.clone(),
        disable: config.disable.clone(),
    })
    .context("failed to load units")?;

    info!(
        unit_dir = %config.unit_dir.display(),
        units = units.len(),
        "Loaded units"
    );

    init.run(units, &skipped).await?;
    Ok(())
}
