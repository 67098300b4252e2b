//! Status command: drives, quota, and persisted sync state

use anyhow::Result;
use clap::Args;

use onesync_core::domain::newtypes::DriveId;
use onesync_core::ports::remote_drive::RemoteDrive;
use onesync_store::StateFiles;

use crate::wiring::CliContext;

#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let client = ctx.graph_client()?;
        let state_files = StateFiles::new(ctx.config.state_layout());

        let drives = client
            .list_drives()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        if drives.is_empty() {
            println!("No drives visible to this account.");
            return Ok(());
        }

        println!("Sync root: {}", ctx.config.sync_dir.display());
        for drive in &drives {
            println!("\nDrive {} ({})", drive.id, drive.drive_type);
            if let Some(owner) = &drive.owner {
                println!("  owner: {owner}");
            }
            if let (Some(used), Some(total)) = (drive.quota_used, drive.quota_total) {
                println!(
                    "  quota: {:.1} GiB of {:.1} GiB used",
                    used as f64 / (1 << 30) as f64,
                    total as f64 / (1 << 30) as f64
                );
            }
            match state_files.delta_link(&drive.id) {
                Ok(Some(_)) => println!("  sync state: delta link present (incremental)"),
                Ok(None) => println!("  sync state: no delta link (next sync is full)"),
                Err(e) => println!("  sync state: unreadable ({e})"),
            }
        }

        let configured: Vec<DriveId> = ctx
            .config
            .drives
            .iter()
            .filter_map(|raw| DriveId::new(raw.clone()).ok())
            .collect();
        if !configured.is_empty() {
            println!(
                "\nConfigured drives: {}",
                configured
                    .iter()
                    .map(|d| d.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }
}
