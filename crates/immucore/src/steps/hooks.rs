//! Stage runner hooks and the boot sentinel.

use std::sync::Arc;

use immucore_common::ImmucoreResult;

use crate::context::{BootContext, BootMode};
use crate::sentinel;
use crate::system::stages::{self, INITRAMFS_STAGE, ROOTFS_STAGE};

/// Run the `rootfs` stage. Outside UKI the staged root is linked at its
/// final paths for the duration of the stage.
pub async fn rootfs_hook(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let links = if ctx.mode == BootMode::Uki {
        Vec::new()
    } else {
        stages::link_rootfs_paths(&ctx)?
    };
    let result = stages::run_stage(&ctx, ROOTFS_STAGE).await;
    stages::unlink_rootfs_paths(&links);
    result
}

/// Run the `initramfs` stage.
pub async fn initramfs_hook(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    stages::run_stage(&ctx, INITRAMFS_STAGE).await
}

/// Write the boot-state sentinel files.
pub async fn write_sentinel(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    sentinel::write(&ctx)?;
    Ok(())
}
