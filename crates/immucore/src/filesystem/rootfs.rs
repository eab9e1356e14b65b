//! Kernel API filesystems for a UKI initramfs.

use std::path::Path;

use immucore_common::{ImmucoreError, ImmucoreResult};

use crate::context::BootContext;
use crate::host::MountRequest;

/// Baseline mounts: (source, target, fstype, options).
const BASE_MOUNTS: &[(&str, &str, &str, &[&str])] = &[
    ("proc", "/proc", "proc", &["nosuid", "nodev", "noexec"]),
    ("sysfs", "/sys", "sysfs", &["nosuid", "nodev", "noexec"]),
    ("securityfs", "/sys/kernel/security", "securityfs", &["nosuid", "nodev", "noexec"]),
    ("debugfs", "/sys/kernel/debug", "debugfs", &["nosuid", "nodev", "noexec"]),
    ("efivarfs", "/sys/firmware/efi/efivars", "efivarfs", &["nosuid", "nodev", "noexec"]),
    ("devtmpfs", "/dev", "devtmpfs", &["nosuid", "mode=755"]),
    ("devpts", "/dev/pts", "devpts", &["nosuid", "noexec", "gid=5", "mode=620", "ptmxmode=000"]),
    ("tmpfs", "/dev/shm", "tmpfs", &["nosuid", "nodev", "mode=1777"]),
    ("tmpfs", "/tmp", "tmpfs", &["nosuid", "nodev", "mode=1777"]),
];

/// Mounts whose propagation must be shared so the pivot can move them.
const SHARED_MOUNTS: &[&str] = &["/sys", "/dev", "/tmp"];

/// Mount every baseline filesystem under the initramfs root.
///
/// Existing mounts are kept. All failures are reported together.
pub fn mount_base(ctx: &BootContext) -> ImmucoreResult<()> {
    let mut errors = Vec::new();

    for (source, target, fstype, options) in BASE_MOUNTS {
        let target = ctx.paths.host(target);
        if let Err(e) = mount_one(ctx, source, &target, fstype, options) {
            tracing::error!(target = %target.display(), error = %e, "Base mount failed");
            errors.push(e);
        }
    }

    for target in SHARED_MOUNTS {
        let target = ctx.paths.host(target);
        if let Err(e) = ctx.host.make_shared(&target, false) {
            tracing::error!(target = %target.display(), error = %e, "Could not mark mount shared");
            errors.push(e);
        }
    }

    ImmucoreError::collect(errors)
}

fn mount_one(
    ctx: &BootContext,
    source: &str,
    target: &Path,
    fstype: &str,
    options: &[&str],
) -> ImmucoreResult<()> {
    std::fs::create_dir_all(target)?;
    let request = MountRequest {
        source: source.to_string(),
        target: target.to_path_buf(),
        fstype: fstype.to_string(),
        options: options.iter().map(ToString::to_string).collect(),
    };
    match ctx.host.mount(&request) {
        Err(e) if e.is_already_mounted() => Ok(()),
        other => other,
    }
}
