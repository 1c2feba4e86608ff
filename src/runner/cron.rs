use super::schedule::{Schedule, Scheduler};
use super::RunnerOptions;
use crate::error::{Error, Result};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs the unit's command on a cron schedule.
pub struct CronAction {
    opts: RunnerOptions,
    schedule: Arc<Schedule>,
}

impl CronAction {
    /// Fails when the schedule does not parse.
    pub fn new(opts: RunnerOptions) -> Result<Self> {
        let schedule = Schedule::parse(&opts.unit.cron)?;
        Ok(Self {
            opts,
            schedule: Arc::new(schedule),
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.opts.print("controller started");
        let result = self.run_scheduled(&cancel).await;
        self.opts.print("controller exited");
        result
    }

    async fn run_scheduled(&self, cancel: &CancellationToken) -> Result<()> {
        if self.opts.unit.immediate {
            let result = self.opts.execute().await;
            self.opts.escalate("failed executing", result)?;
        }

        // only critical units ever send, a second failure is dropped
        let (tx, mut rx) = mpsc::channel::<Error>(1);

        let scheduler = Scheduler::new();
        let opts = self.opts.clone();
        scheduler.add(Arc::clone(&self.schedule), move || {
            let opts = opts.clone();
            let tx = tx.clone();
            async move {
                opts.print("triggered");
                let result = opts.execute().await;
                if let Err(e) = opts.escalate("failed executing", result) {
                    let _ = tx.try_send(e);
                }
            }
            .boxed()
        });
        scheduler.start();

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            Some(e) = rx.recv() => Err(e),
        };

        scheduler.stop().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::options;
    use crate::unit::{Unit, UnitKind};
    use std::time::{Duration, Instant};

    fn unit(cron: &str, argv: &[&str]) -> Unit {
        let mut unit = Unit::new(UnitKind::Cron, "test");
        unit.cron = cron.to_string();
        unit.command = argv.iter().map(|s| s.to_string()).collect();
        unit
    }

    #[tokio::test]
    async fn test_cron_immediate_and_tick() {
        let mut unit = unit("@every 2s", &["echo", "hhhlll"]);
        unit.immediate = true;
        let (opts, buf) = options(unit);
        let action = CronAction::new(opts).unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            stopper.cancel();
        });

        action.run(cancel).await.unwrap();
        assert_eq!(buf.contents().matches("hhhlll\n").count(), 2);
        assert!(buf.contents().contains("cron/test: triggered"));
    }

    #[tokio::test]
    async fn test_cron_without_immediate() {
        let (opts, buf) = options(unit("@every 1s", &["echo", "tick"]));
        let action = CronAction::new(opts).unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });

        action.run(cancel).await.unwrap();
        assert_eq!(buf.contents().matches("tick\n").count(), 0);
    }

    #[tokio::test]
    async fn test_cron_critical_failure_returns() {
        let mut unit = unit("@every 1s", &["false"]);
        unit.critical = true;
        let (opts, _buf) = options(unit);
        let action = CronAction::new(opts).unwrap();

        let started = Instant::now();
        let result = action.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::ExitCode(1))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cron_non_critical_failure_keeps_running() {
        let (opts, buf) = options(unit("@every 1s", &["false"]));
        let action = CronAction::new(opts).unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            stopper.cancel();
        });

        action.run(cancel).await.unwrap();
        assert_eq!(buf.contents().matches("cron/test: failed executing").count(), 2);
    }

    #[test]
    fn test_cron_invalid_expression() {
        let (opts, _buf) = options(unit("every day", &["true"]));
        assert!(matches!(
            CronAction::new(opts),
            Err(Error::InvalidCron { .. })
        ));
    }
}
