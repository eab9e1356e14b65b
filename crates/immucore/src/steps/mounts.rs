//! Steps composing the root filesystem.

use std::sync::Arc;

use immucore_common::fstab::render;
use immucore_common::{ImmucoreError, ImmucoreResult};
use tokio::time::Instant;

use crate::context::BootContext;
use crate::filesystem::{
    MountOperation, base_overlay, bind_mount, mount, mount_with_base_overlay, mount_with_fstab,
    sort_bind_mounts,
};
use crate::layout;
use crate::system::crypt::PERSISTENT_LABEL;
use crate::system::{blockdev, udev};

/// Options of the root image mount, after the mode.
const ROOT_OPTIONS: &[&str] = &["suid", "dev", "exec", "async"];

/// Options of the OEM mount.
const OEM_OPTIONS: &[&str] = &["rw", "suid", "dev", "exec", "noauto", "nouser", "async"];

/// Label substring whose custom mount failures are tolerated.
const OEM_LABEL: &str = "COS_OEM";

/// Mount the state partition read-only or read-write.
pub async fn mount_state(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let device = ctx.by_label(ctx.state_label());
    let target = ctx.state_mountpoint();
    mount(&ctx, &device, &target, "ext4", &[ctx.state.root_mode.as_option()]).await
}

/// Attach the target image to a loop device so its label shows up.
pub async fn discover_state(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let device = &ctx.state.target_device;
    let already = ctx
        .host
        .mounts()?
        .iter()
        .any(|m| m.source == *device || m.target == ctx.rootdir());
    if already {
        tracing::info!(%device, "Target device already mounted");
        return Ok(());
    }

    let image = ctx
        .state
        .target_image
        .as_deref()
        .ok_or(ImmucoreError::MissingTargetImage)?;
    let file = ctx.state_mountpoint().join(image.trim_start_matches('/'));
    let loop_device = blockdev::losetup(&ctx, &file).await?;
    tracing::info!(image = %file.display(), %loop_device, "Target image attached");
    udev::trigger(&ctx).await
}

/// Mount the root image at the staging root.
pub async fn mount_root(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let mut options = vec![ctx.state.root_mode.as_option()];
    options.extend_from_slice(ROOT_OPTIONS);
    mount(&ctx, &ctx.state.target_device, ctx.rootdir(), "ext4", &options).await
}

/// Mount the OEM partition. Failures are tolerated.
pub async fn mount_oem(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let Some(label) = blockdev::oem_label(&ctx).await else {
        tracing::info!("No OEM label, skipping");
        return Ok(());
    };

    let op = MountOperation::new(
        &ctx,
        ctx.by_label(&label),
        ctx.in_root("/oem"),
        "ext4",
        OEM_OPTIONS.iter().map(ToString::to_string).collect(),
    )
    .with_timeout(ctx.cmdline.oem_timeout());
    if let Err(e) = mount_with_fstab(&ctx, &op).await {
        tracing::warn!(%label, error = %e, "OEM mount failed, continuing");
    }
    Ok(())
}

/// Mount a tmpfs on the initramfs `/tmp`. The recorded entry carries it
/// over to the new root.
pub async fn mount_tmpfs(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    mount(&ctx, "tmpfs", &ctx.paths.host("/tmp"), "tmpfs", &["rw"]).await
}

/// Read `cos-layout.env` and the cmdline into the boot state.
pub async fn load_config(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let layout = layout::load(&ctx)?;
    ctx.state.set_layout(layout);
    Ok(())
}

/// Mount the backing store of the writable overlays.
pub async fn mount_base_overlay(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let spec = ctx.state.layout().overlay_base_spec;
    let op = base_overlay(&ctx, &spec)?;
    mount_with_fstab(&ctx, &op).await
}

/// Overlay every writable path. Errors are collected across paths.
pub async fn overlay_mount(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let base = ctx.paths.overlay_base();
    let mut errors = Vec::new();
    for dir in ctx.state.layout().overlay_dirs {
        let op = mount_with_base_overlay(&ctx, &dir, &base);
        if let Err(e) = mount_with_fstab(&ctx, &op).await {
            tracing::error!(%dir, error = %e, "Overlay mount failed");
            errors.push(e);
        }
    }
    ImmucoreError::collect(errors)
}

/// Mount the layout's extra volumes.
pub async fn custom_mounts(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let mut errors = Vec::new();
    for (device, mountpoint) in ctx.state.layout().custom_mounts {
        let mode = if device.contains(PERSISTENT_LABEL) { "rw" } else { "ro" };
        let target = ctx.in_root(&mountpoint);
        match mount(&ctx, &device, &target, "ext4", &[mode]).await {
            Ok(()) => {}
            Err(e) if device.contains(OEM_LABEL) => {
                tracing::warn!(%device, error = %e, "OEM volume mount failed, continuing");
            }
            Err(e) => {
                tracing::error!(%device, %mountpoint, error = %e, "Custom mount failed");
                errors.push(e);
            }
        }
    }
    ImmucoreError::collect(errors)
}

/// Bind persistent state over every bind path, parents first.
pub async fn mount_bind(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let layout = ctx.state.layout();
    let mut errors = Vec::new();
    for path in sort_bind_mounts(&layout.bind_mounts) {
        let op = bind_mount(&ctx, &path, &layout.state_dir);
        if let Err(e) = mount_with_fstab(&ctx, &op).await {
            tracing::error!(%path, error = %e, "Bind mount failed");
            errors.push(e);
        }
    }
    ImmucoreError::collect(errors)
}

/// Write every recorded entry to `<rootdir>/etc/fstab`.
pub async fn write_fstab(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let path = ctx.in_root("/etc/fstab");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let entries = ctx.state.fstabs();
    std::fs::write(&path, render(&entries))?;
    tracing::info!(path = %path.display(), entries = entries.len(), "Wrote fstab");
    Ok(())
}

/// Wait for a live root to be provided by someone else.
pub async fn wait_for_sysroot(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let timeout = ctx.cmdline.sysroot_wait();
    let deadline = Instant::now() + timeout;
    let system = ctx.in_root("/system");

    loop {
        if ctx.rootdir().is_dir() && system.exists() {
            tracing::info!(rootdir = %ctx.rootdir().display(), "Sysroot is ready");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ImmucoreError::Timeout {
                what: format!("{} to appear", system.display()),
                timeout,
            });
        }
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                return Err(ImmucoreError::ContextCanceled {
                    operation: "waiting for sysroot".to_string(),
                });
            }
            () = tokio::time::sleep_until((Instant::now() + ctx.poll_interval).min(deadline)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use immucore_common::{BootPaths, Cmdline};
    use tempfile::tempdir;

    use super::*;
    use crate::host::CommandOutput;
    use crate::host::fake::RecordingHost;

    fn context(root: &Path, cmdline: &str, host: &Arc<RecordingHost>) -> Arc<BootContext> {
        Arc::new(
            BootContext::new(
                Cmdline::from_string(cmdline),
                BootPaths::with_root(root),
                host.clone(),
            )
            .unwrap()
            .with_settle_delay(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn discover_state_attaches_image() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);

        discover_state(ctx.clone()).await.unwrap();

        let image = temp.path().join("sysroot/run/initramfs/cos-state/cOS/active.img");
        assert!(host.ran(&format!("losetup --show -f {}", image.display())));
        assert!(host.ran("udevadm trigger"));
    }

    #[tokio::test]
    async fn discover_state_skips_when_root_mounted() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);
        host.premount(&ctx.state.target_device, ctx.rootdir(), "ext4");

        discover_state(ctx).await.unwrap();
        assert!(!host.ran("losetup"));
    }

    #[tokio::test]
    async fn root_options_follow_mode() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/passive.img rd.cos.debugrw", &host);

        mount_root(ctx.clone()).await.unwrap();

        let fstab = ctx.state.fstabs();
        assert_eq!(
            fstab[0].to_string(),
            "/dev/disk/by-label/COS_PASSIVE / ext4 rw,suid,dev,exec,async 0 0"
        );
    }

    #[tokio::test]
    async fn oem_failure_is_tolerated() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(
            temp.path(),
            "cos-img/filename=/cOS/active.img rd.immucore.oemlabel=COS_OEM rd.immucore.oemtimeout=0",
            &host,
        );
        host.fail_mounts_of(&ctx.by_label("COS_OEM"));

        mount_oem(ctx.clone()).await.unwrap();
        assert!(ctx.state.fstabs().is_empty());
    }

    #[tokio::test]
    async fn oem_without_label_is_skipped() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        host.respond("lsblk", CommandOutput::ok(r#"{"blockdevices": []}"#));
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);

        mount_oem(ctx).await.unwrap();
        assert!(host.attempts().is_empty());
    }

    #[tokio::test]
    async fn overlay_errors_are_collected() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        host.fail_mounts_of("overlay");
        let ctx = Arc::new(
            BootContext::new(
                Cmdline::from_string("cos-img/filename=/cOS/active.img"),
                BootPaths::with_root(temp.path()),
                host.clone(),
            )
            .unwrap()
            .with_settle_delay(Duration::from_millis(5))
            .with_mount_timeout(Duration::from_millis(50)),
        );
        let mut layout = ctx.state.layout();
        layout.overlay_dirs = vec!["/etc".to_string(), "/var".to_string()];
        ctx.state.set_layout(layout);
        host.premount("overlay", &ctx.in_root("/var"), "overlay");

        let err = overlay_mount(ctx.clone()).await.unwrap_err();

        assert!(matches!(err, ImmucoreError::MountExhausted { .. }), "{err}");
        let fstabs = ctx.state.fstabs();
        assert_eq!(fstabs.len(), 1);
        assert_eq!(fstabs[0].file, "/var");
        assert_eq!(fstabs[0].spec, "overlay-var");
    }

    #[tokio::test]
    async fn custom_mount_modes() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);
        let persistent = ctx.by_label("COS_PERSISTENT");
        let data = ctx.by_label("DATA");
        let mut layout = ctx.state.layout();
        layout.custom_mounts.insert(persistent.clone(), "/usr/local".to_string());
        layout.custom_mounts.insert(data.clone(), "/data".to_string());
        ctx.state.set_layout(layout);

        custom_mounts(ctx.clone()).await.unwrap();

        let attempts = host.attempts();
        let options = |source: &str| {
            attempts
                .iter()
                .find(|a| a.source == source)
                .map(|a| a.options.clone())
                .unwrap()
        };
        assert_eq!(options(&persistent), ["rw"]);
        assert_eq!(options(&data), ["ro"]);
    }

    #[tokio::test]
    async fn bind_mounts_run_parents_first() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);
        let mut layout = ctx.state.layout();
        layout.bind_mounts = vec!["/var/lib/rancher".to_string(), "/var".to_string()];
        ctx.state.set_layout(layout);

        mount_bind(ctx.clone()).await.unwrap();

        let files: Vec<_> = ctx.state.fstabs().into_iter().map(|e| e.file).collect();
        assert_eq!(files, ["/var", "/var/lib/rancher"]);
        assert!(ctx.in_root("/usr/local/.state/var.bind").is_dir());
        assert!(ctx.in_root("/usr/local/.state/var-lib-rancher.bind").is_dir());
    }

    #[tokio::test]
    async fn fstab_is_truncated_and_rewritten() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "cos-img/filename=/cOS/active.img", &host);
        let path = ctx.in_root("/etc/fstab");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale line\n").unwrap();

        mount_tmpfs(ctx.clone()).await.unwrap();
        write_fstab(ctx.clone()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tmpfs-tmp /tmp tmpfs rw 0 0\n");
    }

    #[tokio::test]
    async fn sysroot_wait_times_out() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "rd.cos.disable rd.immucore.sysrootwait=0", &host);

        let err = wait_for_sysroot(ctx).await.unwrap_err();
        assert!(matches!(err, ImmucoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn sysroot_wait_sees_late_root() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "rd.cos.disable rd.immucore.sysrootwait=5", &host);

        let system = ctx.in_root("/system");
        let waiter = tokio::spawn(wait_for_sysroot(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::create_dir_all(&system).unwrap();

        waiter.await.unwrap().unwrap();
    }
}
