//! Monitor command: continuous sync driven by filesystem events

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::wiring::CliContext;

#[derive(Debug, Args)]
pub struct MonitorCommand {}

impl MonitorCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let (coordinator, _governor) = ctx.coordinator().await?;
        let cancel = coordinator.cancellation_token();

        // Ctrl-C is the cancellation signal; the engine observes it at
        // every suspension point
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; shutting down");
                cancel.cancel();
            }
        });

        coordinator
            .run_monitor()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        println!("Monitor stopped.");
        Ok(())
    }
}
