//! udev, LVM and kernel module loading.

use std::collections::BTreeSet;

use immucore_common::{BootPaths, ImmucoreResult};
use walkdir::WalkDir;

use crate::context::BootContext;
use crate::host::CommandSpec;

/// Drivers loaded on every UKI boot regardless of the detected hardware.
pub const GENERIC_MODULES: &[&str] = &[
    // block
    "ahci", "nvme", "sd_mod", "sr_mod", "dm_mod", "dm_crypt", "loop", "scsi_mod",
    // filesystems
    "ext4", "vfat", "iso9660", "squashfs", "overlay", "nls_cp437", "nls_iso8859_1",
    // usb
    "usb_storage", "uas", "xhci_pci", "ehci_pci", "usbhid", "hid_generic",
    // virtio
    "virtio_blk", "virtio_scsi", "virtio_pci", "virtio_net", "virtio_console",
    // net
    "e1000", "e1000e", "igb", "r8169",
];

/// Wait for the udev event queue to drain.
pub async fn settle(ctx: &BootContext) -> ImmucoreResult<()> {
    ctx.host
        .run_checked(&CommandSpec::new("udevadm").arg("settle"))
        .await?;
    Ok(())
}

/// Start the udev daemon and replay the coldplug events.
pub async fn start(ctx: &BootContext) -> ImmucoreResult<()> {
    ctx.host
        .run_checked(&CommandSpec::new("systemd-udevd").arg("--daemon"))
        .await?;
    for kind in ["subsystems", "devices"] {
        let trigger = CommandSpec::new("udevadm")
            .args(["trigger", "--action=add"])
            .arg(format!("--type={kind}"));
        ctx.host.run_checked(&trigger).await?;
    }
    settle(ctx).await
}

/// Re-run udev rules so freshly attached devices get their symlinks.
pub async fn trigger(ctx: &BootContext) -> ImmucoreResult<()> {
    ctx.host
        .run_checked(&CommandSpec::new("udevadm").arg("trigger"))
        .await?;
    settle(ctx).await
}

/// Activate every LVM volume group.
pub async fn activate_lvm(ctx: &BootContext) -> ImmucoreResult<()> {
    ctx.host
        .run_checked(&CommandSpec::new("vgchange").arg("-ay"))
        .await?;
    settle(ctx).await
}

/// Unique `modalias` values found under the device tree.
#[must_use]
pub fn probe_modules(paths: &BootPaths) -> Vec<String> {
    let mut aliases = BTreeSet::new();
    for entry in WalkDir::new(paths.sys_devices())
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == "modalias")
    {
        match std::fs::read_to_string(entry.path()) {
            Ok(alias) if !alias.trim().is_empty() => {
                aliases.insert(alias.trim().to_string());
            }
            Ok(_) => {}
            Err(e) => tracing::trace!(path = %entry.path().display(), error = %e, "modalias unreadable"),
        }
    }
    aliases.into_iter().collect()
}

/// Load detected and generic drivers. Individual failures are logged only.
///
/// Returns how many modules failed to load.
pub async fn load_modules(ctx: &BootContext) -> usize {
    let mut modules = probe_modules(&ctx.paths);
    modules.extend(GENERIC_MODULES.iter().map(ToString::to_string));
    tracing::info!(count = modules.len(), "Loading kernel modules");

    let mut failures = 0;
    for module in &modules {
        let modprobe = CommandSpec::new("modprobe").args(["-b", module.as_str()]);
        if let Err(e) = ctx.host.run_checked(&modprobe).await {
            tracing::debug!(%module, error = %e, "modprobe failed");
            failures += 1;
        }
    }
    failures
}
