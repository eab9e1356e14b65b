//! Invoking the cloud-config stage runner.

use std::os::unix::fs::symlink;
use std::path::PathBuf;

use immucore_common::{ImmucoreError, ImmucoreResult};

use crate::context::{BootContext, BootMode};
use crate::host::CommandSpec;

/// Stage runner binary.
pub const STAGE_RUNNER: &str = "elemental";

/// Stage run right after the rootfs is available.
pub const ROOTFS_STAGE: &str = "rootfs";

/// Stage run once the filesystem is fully composed.
pub const INITRAMFS_STAGE: &str = "initramfs";

/// Command line for `stage`. The initramfs stage of a non-UKI boot runs
/// chrooted into the new root.
#[must_use]
pub fn stage_command(ctx: &BootContext, stage: &str) -> CommandSpec {
    let chrooted = stage == INITRAMFS_STAGE && ctx.mode != BootMode::Uki;
    let mut cmd = if chrooted {
        CommandSpec::new("chroot")
            .arg(ctx.rootdir().display().to_string())
            .arg(STAGE_RUNNER)
    } else {
        CommandSpec::new(STAGE_RUNNER)
    };
    cmd = cmd.args(["run-stage", stage]);
    if let Some(uri) = ctx.cmdline.setup_uri() {
        cmd = cmd.env("COS_SETUP", uri);
    }
    cmd
}

/// Run `stage`, keeping its output in the stage log.
pub async fn run_stage(ctx: &BootContext, stage: &str) -> ImmucoreResult<()> {
    let cmd = stage_command(ctx, stage);
    tracing::info!(%stage, %cmd, "Running stage");
    let output = ctx.host.run(&cmd).await?;

    let log = ctx.paths.stage_log(stage);
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&log, format!("{}{}", output.stdout, output.stderr))?;

    if output.success() {
        Ok(())
    } else {
        Err(ImmucoreError::Command {
            program: cmd.program,
            status: output
                .code
                .map_or_else(|| "killed".to_string(), |code| format!("exit {code}")),
            stderr: format!("see {}", log.display()),
        })
    }
}

/// Links making the staged root visible at its final paths while the rootfs
/// stage runs. Returns the links created, for removal afterwards.
pub fn link_rootfs_paths(ctx: &BootContext) -> ImmucoreResult<Vec<PathBuf>> {
    let mut created = Vec::new();
    for name in ["system", "oem"] {
        let link = ctx.paths.host(format!("/{name}"));
        if link.symlink_metadata().is_ok() {
            continue;
        }
        symlink(ctx.in_root(name), &link)?;
        created.push(link);
    }
    Ok(created)
}

/// Remove links created by [`link_rootfs_paths`].
pub fn unlink_rootfs_paths(links: &[PathBuf]) {
    for link in links {
        if let Err(e) = std::fs::remove_file(link) {
            tracing::debug!(link = %link.display(), error = %e, "Could not remove link");
        }
    }
}
