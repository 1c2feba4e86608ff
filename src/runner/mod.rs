//! Runners drive units.
//!
//! Every [`Unit`] is materialized into exactly one [`Runner`] at startup. The
//! runner carries the unit's priority order and whether it is long running,
//! plus a [`RunnerAction`] that does the actual work until it completes or
//! the cancellation token fires.

mod cron;
mod daemon;
mod once;
mod render;
pub mod schedule;

pub use self::cron::CronAction;
pub use self::daemon::DaemonAction;
pub use self::once::OnceAction;
pub use self::render::{sanitize_lines, RenderAction};
pub use self::schedule::{Schedule, Scheduler};

use crate::error::{Error, Result};
use crate::exec::{self, Manager};
use crate::log::Logger;
use crate::unit::{Unit, UnitKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a runner action needs to execute its unit.
#[derive(Clone)]
pub struct RunnerOptions {
    /// Unit being run
    pub unit: Unit,
    /// Shared process manager
    pub exec: Arc<Manager>,
    /// The unit's own log sink
    pub logger: Logger,
    /// Backoff between daemon restarts
    pub restart_delay: Duration,
}

impl RunnerOptions {
    pub fn print(&self, message: &str) {
        self.logger
            .printf(format_args!("{}: {}", self.unit.label(), message));
    }

    pub fn printf(&self, args: fmt::Arguments<'_>) {
        self.print(&args.to_string());
    }

    pub fn error(&self, message: &str) {
        self.logger
            .errorf(format_args!("{}: {}", self.unit.label(), message));
    }

    pub fn errorf(&self, args: fmt::Arguments<'_>) {
        self.error(&args.to_string());
    }

    /// Run the unit's command once.
    pub async fn execute(&self) -> Result<()> {
        self.exec
            .execute(&self.unit.execution_request(), &self.logger)
            .await
    }

    /// Log a failure, then hand it back only when the unit is critical.
    pub fn escalate(&self, context: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.errorf(format_args!("{}: {}", context, e));
                if self.unit.critical {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Check what the process manager would reject, before anything runs.
    fn validate_command(&self) -> Result<()> {
        self.unit.require_command()?;
        if let Some(ref shell) = self.unit.shell {
            if exec::split_shell(shell)?.is_empty() {
                return Err(Error::InvalidShell(shell.clone()));
            }
        }
        if let Some(ref dir) = self.unit.dir {
            exec::check_dir(dir)?;
        }
        Ok(())
    }
}

/// The per-kind behavior of a runner.
pub enum RunnerAction {
    Render(RenderAction),
    Once(OnceAction),
    Daemon(DaemonAction),
    Cron(CronAction),
}

/// A unit materialized for execution.
pub struct Runner {
    /// Priority order, lower runs first
    pub order: u32,
    /// Long runners live until shutdown
    pub long: bool,
    label: String,
    action: RunnerAction,
}

impl Runner {
    /// Validate the unit and build the action for its kind.
    pub fn create(opts: RunnerOptions) -> Result<Self> {
        let kind = opts.unit.kind;
        let label = opts.unit.label();

        let action = match kind {
            UnitKind::Render => {
                opts.unit.require_files()?;
                RunnerAction::Render(RenderAction::new(opts))
            }
            UnitKind::Once => {
                opts.validate_command()?;
                RunnerAction::Once(OnceAction::new(opts))
            }
            UnitKind::Daemon => {
                opts.validate_command()?;
                RunnerAction::Daemon(DaemonAction::new(opts))
            }
            UnitKind::Cron => {
                opts.validate_command()?;
                opts.unit.require_cron()?;
                RunnerAction::Cron(CronAction::new(opts)?)
            }
        };

        Ok(Self {
            order: kind.order(),
            long: kind.is_long(),
            label,
            action,
        })
    }

    /// `kind/name` of the unit.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn action(&self) -> &RunnerAction {
        &self.action
    }

    /// Run the action. Any error returned is a critical unit failure.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let result = match self.action {
            RunnerAction::Render(ref action) => action.run(cancel).await,
            RunnerAction::Once(ref action) => action.run(cancel).await,
            RunnerAction::Daemon(ref action) => action.run(cancel).await,
            RunnerAction::Cron(ref action) => action.run(cancel).await,
        };
        result.map_err(|e| Error::critical(self.label.clone(), e))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::RunnerOptions;
    use crate::exec::Manager;
    use crate::log::testing::{capture_logger, CaptureBuffer};
    use crate::unit::Unit;
    use std::sync::Arc;
    use std::time::Duration;

    /// Options over a capturing logger and a fresh manager.
    pub fn options(unit: Unit) -> (RunnerOptions, CaptureBuffer) {
        let (logger, buf) = capture_logger();
        let opts = RunnerOptions {
            unit,
            exec: Arc::new(Manager::new()),
            logger,
            restart_delay: Duration::from_secs(5),
        };
        (opts, buf)
    }
}
