//! The supervisor: runs units in order and owns the shutdown sequence.

use crate::config::InitConfig;
use crate::error::{Error, Result};
use crate::exec::Manager;
use crate::loader::NAME_MINIT;
use crate::log::{Logger, LoggerOptions, RotatingFileOptions};
use crate::runner::{Runner, RunnerOptions};
use crate::unit::Unit;
use nix::sys::signal::Signal;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The minit supervisor.
pub struct Init {
    /// Configuration
    config: InitConfig,
    /// The supervisor's own log sink
    logger: Logger,
    /// Process manager shared by every runner
    exec: Arc<Manager>,
}

impl Init {
    /// Create the supervisor and its log directories.
    pub fn new(config: InitConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let logger = Logger::new(LoggerOptions {
            console_prefix: format!("{}: ", NAME_MINIT),
            file: file_options(&config, NAME_MINIT),
            ..Default::default()
        })?;
        Ok(Self::with_logger(config, logger))
    }

    /// Create the supervisor around an existing log sink.
    pub fn with_logger(config: InitConfig, logger: Logger) -> Self {
        Self {
            config,
            logger,
            exec: Arc::new(Manager::new()),
        }
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.exec
    }

    /// Log sink of a single unit: console plus `<name>.out.log`/`<name>.err.log`.
    fn unit_logger(&self, unit: &Unit) -> Result<Logger> {
        Ok(Logger::new(LoggerOptions {
            file: file_options(&self.config, &unit.name),
            ..Default::default()
        })?)
    }

    /// Materialize one runner per unit, sorted by priority.
    ///
    /// Units of the same kind keep their declaration order.
    pub fn create_runners(&self, units: Vec<Unit>) -> Result<Vec<Runner>> {
        let mut runners = Vec::with_capacity(units.len());
        for unit in units {
            let logger = self.unit_logger(&unit)?;
            let label = unit.label();
            let runner = Runner::create(RunnerOptions {
                unit,
                exec: Arc::clone(&self.exec),
                logger,
                restart_delay: self.config.restart_delay,
            })
            .map_err(|e| Error::InvalidUnit(format!("{}: {}", label, e)))?;
            debug!(unit = %label, order = runner.order, long = runner.long, "created runner");
            runners.push(runner);
        }
        runners.sort_by_key(|runner| runner.order);
        Ok(runners)
    }

    /// Run until SIGINT, SIGTERM or a critical unit failure.
    pub async fn run(&self, units: Vec<Unit>, skipped: &[Unit]) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let shutdown = async move {
            tokio::select! {
                _ = sigterm.recv() => Signal::SIGTERM,
                _ = sigint.recv() => Signal::SIGINT,
            }
        };

        self.run_until(units, skipped, shutdown).await
    }

    /// Run until `shutdown` resolves or a critical unit fails.
    ///
    /// The signal `shutdown` resolves to is forwarded to every child still
    /// alive after the grace window. Returns the critical failure, if any.
    pub async fn run_until<F>(&self, units: Vec<Unit>, skipped: &[Unit], shutdown: F) -> Result<()>
    where
        F: Future<Output = Signal>,
    {
        self.logger.print("starting");
        info!(units = units.len(), skipped = skipped.len(), "minit starting");

        for unit in skipped {
            self.logger.printf(format_args!("unit skipped: {}", unit.name));
        }

        let runners = match self.create_runners(units) {
            Ok(runners) => runners,
            Err(e) => {
                self.logger.errorf(format_args!("failed creating runners: {}", e));
                return Err(e);
            }
        };
        let (long, short): (Vec<Runner>, Vec<Runner>) =
            runners.into_iter().partition(|runner| runner.long);

        for runner in &short {
            if let Err(e) = runner.run(CancellationToken::new()).await {
                self.logger.errorf(format_args!("{}", e));
                return Err(e);
            }
        }

        if long.is_empty() && self.config.quick_exit {
            self.logger.print("no long runners and quick exit is set");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Error>(1);
        let mut tasks = JoinSet::new();

        for runner in long {
            let cancel = cancel.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Err(e) = runner.run(cancel).await {
                    // a failure is already pending, this one is dropped
                    let _ = tx.try_send(e);
                }
            });
        }
        drop(tx);

        self.logger.print("started");
        info!("minit started");

        tokio::pin!(shutdown);
        let (sig, failure) = tokio::select! {
            sig = &mut shutdown => {
                self.logger.printf(format_args!("signal caught: {}", sig.as_str()));
                (sig, None)
            }
            Some(e) = rx.recv() => {
                self.logger.errorf(format_args!("{}", e));
                (Signal::SIGTERM, Some(e))
            }
        };

        info!(signal = %sig.as_str(), "minit shutting down");
        cancel.cancel();

        tokio::time::sleep(self.config.shutdown_grace).await;
        self.exec.signal(sig);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "runner task failed");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                self.logger.print("exited");
                Ok(())
            }
        }
    }
}

fn file_options(config: &InitConfig, filename: &str) -> Option<RotatingFileOptions> {
    config.log_dir.as_ref().map(|dir| RotatingFileOptions {
        dir: dir.clone(),
        filename: filename.to_string(),
        max_file_size: config.log_max_size,
        max_file_count: config.log_max_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::testing::capture_logger;
    use crate::unit::UnitKind;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config(log_dir: &TempDir) -> InitConfig {
        InitConfig {
            unit_dir: log_dir.path().join("units"),
            log_dir: Some(log_dir.path().to_path_buf()),
            shutdown_grace: Duration::from_millis(200),
            restart_delay: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn unit(kind: UnitKind, name: &str, argv: &[&str]) -> Unit {
        let mut unit = Unit::new(kind, name);
        unit.command = argv.iter().map(|s| s.to_string()).collect();
        unit
    }

    #[test]
    fn test_create_runners_sorted() {
        let dir = TempDir::new().unwrap();
        let (logger, _buf) = capture_logger();
        let init = Init::with_logger(config(&dir), logger);

        let mut render = Unit::new(UnitKind::Render, "conf");
        render.files = vec!["/nonexistent/*.conf".to_string()];
        let mut cron = unit(UnitKind::Cron, "tick", &["true"]);
        cron.cron = "@every 1m".to_string();

        let runners = init
            .create_runners(vec![
                cron,
                unit(UnitKind::Daemon, "web", &["true"]),
                unit(UnitKind::Once, "b", &["true"]),
                render,
                unit(UnitKind::Once, "a", &["true"]),
            ])
            .unwrap();

        let labels: Vec<_> = runners.iter().map(|r| r.label().to_string()).collect();
        assert_eq!(
            labels,
            vec!["render/conf", "once/b", "once/a", "daemon/web", "cron/tick"]
        );
    }

    #[tokio::test]
    async fn test_quick_exit() {
        let dir = TempDir::new().unwrap();
        let (logger, buf) = capture_logger();
        let mut config = config(&dir);
        config.quick_exit = true;
        let init = Init::with_logger(config, logger);

        init.run_until(
            vec![unit(UnitKind::Once, "job", &["echo", "quick"])],
            &[],
            std::future::pending(),
        )
        .await
        .unwrap();

        assert!(buf.contents().contains("no long runners and quick exit is set"));
        let out = std::fs::read_to_string(dir.path().join("job.out.log")).unwrap();
        assert!(out.contains("quick\n"));
    }

    #[tokio::test]
    async fn test_critical_short_runner_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let (logger, _buf) = capture_logger();
        let init = Init::with_logger(config(&dir), logger);

        let mut failing = unit(UnitKind::Once, "setup", &["false"]);
        failing.critical = true;

        let result = init
            .run_until(
                vec![failing, unit(UnitKind::Daemon, "web", &["echo", "web-ran"])],
                &[],
                std::future::pending(),
            )
            .await;

        assert!(matches!(result, Err(Error::Critical { .. })));
        let web = std::fs::read_to_string(dir.path().join("web.out.log")).unwrap_or_default();
        assert!(!web.contains("web-ran"));
    }

    #[tokio::test]
    async fn test_signal_shutdown() {
        let dir = TempDir::new().unwrap();
        let (logger, buf) = capture_logger();
        let init = Init::with_logger(config(&dir), logger);

        let mut daemon = unit(UnitKind::Daemon, "sleeper", &["sleep", "30"]);
        daemon.success_codes = vec![0, -1];

        let skipped = vec![Unit::new(UnitKind::Daemon, "ignored")];
        let started = Instant::now();
        init.run_until(vec![daemon], &skipped, async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Signal::SIGTERM
        })
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(init.manager().live_pids().is_empty());

        let contents = buf.contents();
        assert!(contents.contains("starting"));
        assert!(contents.contains("unit skipped: ignored"));
        assert!(contents.contains("started"));
        assert!(contents.contains("signal caught: SIGTERM"));
        assert!(contents.contains("exited"));
    }

    #[tokio::test]
    async fn test_critical_long_runner_triggers_shutdown() {
        let dir = TempDir::new().unwrap();
        let (logger, _buf) = capture_logger();
        let init = Init::with_logger(config(&dir), logger);

        let mut crashing = unit(UnitKind::Daemon, "crashing", &["sh", "-c", "exit 3"]);
        crashing.critical = true;
        let mut sleeper = unit(UnitKind::Daemon, "sleeper", &["sleep", "30"]);
        sleeper.success_codes = vec![0, -1];

        let started = Instant::now();
        let result = init
            .run_until(vec![crashing, sleeper], &[], std::future::pending())
            .await;

        match result {
            Err(Error::Critical { unit, source }) => {
                assert_eq!(unit, "daemon/crashing");
                assert!(matches!(*source, Error::ExitCode(3)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(init.manager().live_pids().is_empty());
    }
}
