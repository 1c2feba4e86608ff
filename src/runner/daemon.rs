use super::RunnerOptions;
use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// Keeps the unit's command running, restarting it after every exit.
pub struct DaemonAction {
    opts: RunnerOptions,
}

impl DaemonAction {
    pub fn new(opts: RunnerOptions) -> Self {
        Self { opts }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.opts.print("controller started");
        let result = self.run_loop(&cancel).await;
        self.opts.print("controller exited");
        result
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let result = self.opts.execute().await;
            self.opts.escalate("failed executing", result)?;

            if cancel.is_cancelled() {
                return Ok(());
            }

            self.opts.print("restarting");

            tokio::select! {
                _ = tokio::time::sleep(self.opts.restart_delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
