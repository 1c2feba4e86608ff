use super::RunnerOptions;
use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// Runs the unit's command a single time.
pub struct OnceAction {
    opts: RunnerOptions,
}

impl OnceAction {
    pub fn new(opts: RunnerOptions) -> Self {
        Self { opts }
    }

    fn blocking(&self) -> bool {
        self.opts.unit.blocking != Some(false)
    }

    pub async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        self.opts.print("controller started");

        let result = if self.blocking() {
            let result = self.opts.execute().await;
            self.opts.escalate("failed executing", result)
        } else {
            // nobody waits for a detached run, failures only get logged
            let opts = self.opts.clone();
            tokio::spawn(async move {
                let result = opts.execute().await;
                let _ = opts.escalate("failed executing (non-blocking)", result);
            });
            Ok(())
        };

        self.opts.print("controller exited");
        result
    }
}
