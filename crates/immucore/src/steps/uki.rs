//! Steps specific to unified kernel image boots.

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use immucore_common::{ImmucoreError, ImmucoreResult};

use crate::context::BootContext;
use crate::filesystem::{mount, pivot, rootfs};
use crate::host::CommandSpec;
use crate::sentinel;
use crate::system::{blockdev, efi, udev};

/// Filesystem label of UKI install media.
pub const INSTALL_LABEL: &str = "UKI_ISO_INSTALL";

/// Policy every system extension image must satisfy.
pub const SYSEXT_IMAGE_POLICY: &str = "root=verity+signed+absent:usr=verity+signed+absent";

/// Lookups of the install media label before falling back to the CD drive.
const INSTALL_MEDIA_ATTEMPTS: u32 = 5;

/// Kernel filesystems, secure boot gate, TPM phase and UKI payload.
pub async fn uki_base_mounts(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    rootfs::mount_base(&ctx)?;

    if !efi::secure_boot_enabled(&ctx.paths) {
        if ctx.cmdline.secure_boot_waived() {
            tracing::warn!("Secure boot is disabled, continuing as requested by the cmdline");
        } else {
            return Err(ImmucoreError::SecureBootDisabled);
        }
    }

    let pcrphase = CommandSpec::new(efi::PCRPHASE).arg("enter-initrd");
    if let Err(e) = ctx.host.run_checked(&pcrphase).await {
        tracing::warn!(error = %e, "Could not measure initrd entry");
    }

    copy_extra(&ctx)
}

/// Copy the files shipped next to the UKI (TPM public key, signatures) into
/// `/run/systemd`.
fn copy_extra(ctx: &BootContext) -> ImmucoreResult<()> {
    let extra = ctx.paths.extra();
    if !extra.is_dir() {
        tracing::debug!(path = %extra.display(), "No UKI payload");
        return Ok(());
    }
    let dest = ctx.paths.systemd_run();
    std::fs::create_dir_all(&dest)?;
    for entry in std::fs::read_dir(&extra)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            tracing::debug!(file = %entry.path().display(), "Copied UKI payload");
        }
    }
    Ok(())
}

/// Mount the tmpfs the pivot will rebuild the root in.
pub async fn uki_pivot_to_sysroot(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    pivot::stage_sysroot(&ctx)?;
    Ok(())
}

/// Load hardware and generic drivers. Failures are tolerated.
pub async fn uki_kernel_modules(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    let failures = udev::load_modules(&ctx).await;
    if failures > 0 {
        tracing::warn!(failures, "Some kernel modules failed to load");
    }
    Ok(())
}

/// Start udev and wait for coldplug.
pub async fn uki_udev(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    udev::start(&ctx).await
}

/// Mount the install media and its EFI image. Failures are tolerated.
pub async fn uki_mount_livecd(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    if let Err(e) = mount_livecd(&ctx).await {
        tracing::warn!(error = %e, "Install media mount failed, continuing");
    }
    Ok(())
}

async fn mount_livecd(ctx: &BootContext) -> ImmucoreResult<()> {
    let device = find_install_media(ctx).await?;
    let live = ctx.in_root("/run/initramfs/live");
    mount(ctx, &device, &live, "iso9660", &["ro"]).await?;

    let loop_device = blockdev::losetup(ctx, &live.join("efiboot.img")).await?;
    mount(ctx, &loop_device, &ctx.in_root("/run/rootfsbase"), "vfat", &["ro"]).await
}

async fn find_install_media(ctx: &BootContext) -> ImmucoreResult<String> {
    let by_label = ctx.by_label(INSTALL_LABEL);
    for attempt in 1..=INSTALL_MEDIA_ATTEMPTS {
        if Path::new(&by_label).exists() {
            return Ok(by_label);
        }
        tracing::debug!(attempt, device = %by_label, "Install media not there yet");
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                return Err(ImmucoreError::ContextCanceled {
                    operation: "looking for install media".to_string(),
                });
            }
            () = tokio::time::sleep(ctx.settle_delay * attempt) => {}
        }
    }
    Ok(ctx.paths.host("/dev/sr0").display().to_string())
}

/// Mount the EFI system partition read-only. Failures are tolerated.
pub async fn uki_mount_esp(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    if let Err(e) = mount_esp(&ctx).await {
        tracing::warn!(error = %e, "ESP mount failed, continuing");
    }
    Ok(())
}

async fn mount_esp(ctx: &BootContext) -> ImmucoreResult<()> {
    let esp = blockdev::find_esp(ctx).await?;
    if esp.is_mounted() {
        tracing::info!(device = %esp.name, mountpoint = ?esp.mountpoint, "ESP already mounted");
        return Ok(());
    }
    let device = esp.path(&ctx.paths).display().to_string();
    mount(ctx, &device, &ctx.in_root("/efi"), "vfat", &["ro"]).await
}

/// Link validated system extensions into `/run/extensions`. Failures are
/// tolerated.
pub async fn uki_copy_sysext(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    match copy_sysext(&ctx).await {
        Ok(linked) => tracing::info!(linked = linked.len(), "System extensions ready"),
        Err(e) => tracing::warn!(error = %e, "System extension setup failed, continuing"),
    }
    Ok(())
}

/// Validate and link every `.raw` image for the current boot state, then the
/// common ones. A name already linked is skipped.
pub async fn copy_sysext(ctx: &BootContext) -> ImmucoreResult<Vec<PathBuf>> {
    let root = ctx.paths.extra_sysext();
    let mut dirs = Vec::new();
    if let Some(dir) = sentinel::detect(ctx).sysext_dir() {
        dirs.push(root.join(dir));
    }
    dirs.push(root.join("common"));

    let extensions = ctx.paths.extensions();
    std::fs::create_dir_all(&extensions)?;

    let mut linked = Vec::new();
    for dir in dirs {
        for image in raw_images(&dir)? {
            let Some(name) = image.file_name() else { continue };
            let link = extensions.join(name);
            if link.symlink_metadata().is_ok() {
                tracing::debug!(image = %image.display(), "Extension already linked, skipping");
                continue;
            }

            let validate = CommandSpec::new("systemd-dissect")
                .arg("--validate")
                .arg(format!("--image-policy={SYSEXT_IMAGE_POLICY}"))
                .arg(image.display().to_string());
            if let Err(e) = ctx.host.run_checked(&validate).await {
                tracing::warn!(image = %image.display(), error = %e, "Extension failed validation");
                continue;
            }

            symlink(&image, &link)?;
            tracing::info!(image = %image.display(), "Linked system extension");
            linked.push(link);
        }
    }
    Ok(linked)
}

fn raw_images(dir: &Path) -> ImmucoreResult<Vec<PathBuf>> {
    let pattern = dir.join("*.raw");
    let pattern = pattern.to_str().ok_or_else(|| {
        ImmucoreError::config(format!("non UTF-8 sysext path {}", dir.display()))
    })?;
    let mut images: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| ImmucoreError::config(format!("bad sysext pattern: {e}")))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    images.sort();
    Ok(images)
}

/// Switch to the composed root and execute the real init. Every failure
/// ends in the emergency shell.
pub async fn uki_init(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    if let Err(e) = pivot::switch_to_sysroot(&ctx).await {
        tracing::error!(error = %e, "Switching root failed");
        return pivot::emergency_shell(&ctx, e);
    }
    pivot::exec_init(&ctx)
}
