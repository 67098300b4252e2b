//! Sync command: run one synchronization cycle

use anyhow::Result;
use clap::Args;

use crate::wiring::CliContext;

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Discard the stored delta links and reingest the full remote state
    #[arg(long)]
    pub resync: bool,

    /// Compute and log what would happen without transferring anything
    #[arg(long)]
    pub dry_run: bool,

    /// Never upload or delete remotely
    #[arg(long)]
    pub download_only: bool,

    /// Never download or delete locally
    #[arg(long)]
    pub upload_only: bool,
}

impl SyncCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let mut config = ctx.config.clone();
        config.resync |= self.resync;
        config.dry_run |= self.dry_run;
        config.download_only |= self.download_only;
        config.upload_only |= self.upload_only;

        let (coordinator, _governor) = ctx.with_config(config).coordinator().await?;

        let report = coordinator
            .run()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        println!("Sync complete: {report}");
        if !report.is_clean() {
            for failure in &report.failures {
                eprintln!(
                    "  {} [{}]: {}",
                    failure.path, failure.category, failure.message
                );
            }
        }
        Ok(())
    }
}
