//! Writable overlays over the read-only rootfs.

use std::path::{Path, PathBuf};

use immucore_common::fstab::flatten_path;
use immucore_common::{ImmucoreError, ImmucoreResult};

use crate::context::BootContext;
use crate::filesystem::mounts::{MountKind, MountOperation};

/// Backing store for every overlay upper directory.
///
/// `spec` is `tmpfs:<size>`, `LABEL=<label>` or `UUID=<uuid>`.
pub fn base_overlay(ctx: &BootContext, spec: &str) -> ImmucoreResult<MountOperation> {
    let target = ctx.paths.overlay_base();

    if let Some(size) = spec.strip_prefix("tmpfs:") {
        if size.is_empty() {
            return Err(ImmucoreError::config(format!(
                "overlay base {spec:?} has no size"
            )));
        }
        return Ok(MountOperation::new(
            ctx,
            "tmpfs",
            target,
            "tmpfs",
            vec!["defaults".to_string(), format!("size={size}")],
        ));
    }

    if spec.starts_with("LABEL=") || spec.starts_with("UUID=") {
        let device = ctx.resolve_spec(spec);
        return Ok(MountOperation::new(
            ctx,
            device,
            target,
            "ext4",
            vec!["defaults".to_string()],
        ));
    }

    Err(ImmucoreError::config(format!(
        "invalid overlay base {spec:?}: expected tmpfs:<size>, LABEL=<label> or UUID=<uuid>"
    )))
}

/// overlayfs over `<rootdir>/<mountpoint>` with its upper layer under `base`.
pub fn mount_with_base_overlay(ctx: &BootContext, mountpoint: &str, base: &Path) -> MountOperation {
    let lower = ctx.in_root(mountpoint);
    let layer_root: PathBuf = base.join(flatten_path(mountpoint)).join(".overlay");
    let upper = layer_root.join("upper");
    let work = layer_root.join("work");

    let options = |lower: &str, upper: &str, work: &str| {
        vec![
            "defaults".to_string(),
            format!("lowerdir={lower}"),
            format!("upperdir={upper}"),
            format!("workdir={work}"),
        ]
    };
    let kernel_options = options(
        &lower.display().to_string(),
        &upper.display().to_string(),
        &work.display().to_string(),
    );
    let fstab_options = options(
        &ctx.normalize(&lower.display().to_string()),
        &ctx.normalize(&upper.display().to_string()),
        &ctx.normalize(&work.display().to_string()),
    );

    let mut op = MountOperation::new(ctx, "overlay", lower, "overlay", kernel_options);
    op.fstab.mntops = fstab_options;
    op.kind = MountKind::Overlay { upper, work };
    op
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use immucore_common::{BootPaths, Cmdline};

    use super::*;
    use crate::host::fake::RecordingHost;

    fn context() -> BootContext {
        BootContext::new(
            Cmdline::from_string("cos-img/filename=/cOS/active.img"),
            BootPaths::new(),
            Arc::new(RecordingHost::new()),
        )
        .unwrap()
    }

    #[test]
    fn tmpfs_base() {
        let ctx = context();
        let op = base_overlay(&ctx, "tmpfs:20%").unwrap();
        assert_eq!(op.source, "tmpfs");
        assert_eq!(op.target, Path::new("/run/overlay"));
        assert_eq!(op.options, vec!["defaults", "size=20%"]);
        assert_eq!(op.fstab.to_string(), "tmpfs-run-overlay /run/overlay tmpfs defaults,size=20% 0 0");
    }

    #[test]
    fn block_base() {
        let ctx = context();
        let op = base_overlay(&ctx, "LABEL=COS_OVERLAY").unwrap();
        assert_eq!(op.source, "/dev/disk/by-label/COS_OVERLAY");
        assert_eq!(op.fstab.spec, "/dev/disk/by-label/COS_OVERLAY");

        let op = base_overlay(&ctx, "UUID=abcd").unwrap();
        assert_eq!(op.source, "/dev/disk/by-uuid/abcd");
    }

    #[test]
    fn invalid_base() {
        let ctx = context();
        for spec in ["", "tmpfs:", "/dev/sda1", "PARTLABEL=x"] {
            let err = base_overlay(&ctx, spec).unwrap_err();
            assert!(matches!(err, ImmucoreError::BadConfig { .. }), "{spec}");
        }
    }

    #[test]
    fn overlay_paths() {
        let ctx = context();
        let op = mount_with_base_overlay(&ctx, "/var/lib", Path::new("/run/overlay"));
        assert_eq!(op.target, Path::new("/sysroot/var/lib"));
        assert_eq!(
            op.kind,
            MountKind::Overlay {
                upper: PathBuf::from("/run/overlay/var-lib/.overlay/upper"),
                work: PathBuf::from("/run/overlay/var-lib/.overlay/work"),
            }
        );
        assert!(op.options.contains(&"lowerdir=/sysroot/var/lib".to_string()));
        assert_eq!(
            op.fstab.to_string(),
            "overlay-var-lib /var/lib overlay defaults,lowerdir=/var/lib,\
             upperdir=/run/overlay/var-lib/.overlay/upper,\
             workdir=/run/overlay/var-lib/.overlay/work 0 0"
        );
    }
}
