//! The step library.
//!
//! Every step is an async function over the shared [`BootContext`]. [`op`]
//! turns a [`StepName`] into a graph operation carrying the step callback and
//! its enablement condition; edges are added by the pipelines.

pub mod crypt;
pub mod hooks;
pub mod mounts;
pub mod uki;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use immucore_common::ImmucoreResult;
use immucore_dag::Op;

use crate::context::{BootContext, BootMode};
use crate::system::blockdev;

/// Identifier of a step, used as its node name and for edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StepName {
    LvmActivate,
    MountTmpfs,
    MountState,
    DiscoverState,
    MountRoot,
    KcryptUpgrade,
    KcryptUnlock,
    MountOem,
    RootfsHook,
    InitramfsHook,
    LoadConfig,
    MountBaseOverlay,
    OverlayMount,
    CustomMounts,
    MountBind,
    WriteFstab,
    WriteSentinel,
    WaitForSysroot,
    UkiBaseMounts,
    UkiPivotToSysroot,
    UkiKernelModules,
    UkiUdev,
    UkiMountLivecd,
    UkiMountEsp,
    UkiUnlock,
    UkiCopySysext,
    UkiInit,
}

impl StepName {
    /// Every step.
    pub const ALL: [Self; 27] = [
        Self::LvmActivate,
        Self::MountTmpfs,
        Self::MountState,
        Self::DiscoverState,
        Self::MountRoot,
        Self::KcryptUpgrade,
        Self::KcryptUnlock,
        Self::MountOem,
        Self::RootfsHook,
        Self::InitramfsHook,
        Self::LoadConfig,
        Self::MountBaseOverlay,
        Self::OverlayMount,
        Self::CustomMounts,
        Self::MountBind,
        Self::WriteFstab,
        Self::WriteSentinel,
        Self::WaitForSysroot,
        Self::UkiBaseMounts,
        Self::UkiPivotToSysroot,
        Self::UkiKernelModules,
        Self::UkiUdev,
        Self::UkiMountLivecd,
        Self::UkiMountEsp,
        Self::UkiUnlock,
        Self::UkiCopySysext,
        Self::UkiInit,
    ];

    /// Node name in the graph.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LvmActivate => "lvm-activate",
            Self::MountTmpfs => "mount-tmpfs",
            Self::MountState => "mount-state",
            Self::DiscoverState => "discover-state",
            Self::MountRoot => "mount-root",
            Self::KcryptUpgrade => "kcrypt-upgrade",
            Self::KcryptUnlock => "kcrypt-unlock",
            Self::MountOem => "mount-oem",
            Self::RootfsHook => "rootfs-hook",
            Self::InitramfsHook => "initramfs-hook",
            Self::LoadConfig => "load-config",
            Self::MountBaseOverlay => "mount-base-overlay",
            Self::OverlayMount => "overlay-mount",
            Self::CustomMounts => "custom-mounts",
            Self::MountBind => "mount-bind",
            Self::WriteFstab => "write-fstab",
            Self::WriteSentinel => "write-sentinel",
            Self::WaitForSysroot => "wait-for-sysroot",
            Self::UkiBaseMounts => "uki-base-mounts",
            Self::UkiPivotToSysroot => "uki-pivot-to-sysroot",
            Self::UkiKernelModules => "uki-kernel-modules",
            Self::UkiUdev => "uki-udev",
            Self::UkiMountLivecd => "uki-mount-livecd",
            Self::UkiMountEsp => "uki-mount-esp",
            Self::UkiUnlock => "uki-unlock",
            Self::UkiCopySysext => "uki-copy-sysext",
            Self::UkiInit => "uki-init",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graph operation for `step`, without edges.
///
/// The install-media conditions of `uki-mount-livecd`, `uki-unlock` and
/// `uki-copy-sysext` are evaluated when the graph run starts, before
/// `uki-base-mounts` has mounted efivarfs and udev has populated
/// `/dev/disk/by-partuuid`. At that point only the `install-mode` cmdline
/// token can mark a boot as install media; the efivar lookup in
/// [`blockdev::is_removable_boot`] finds nothing yet.
#[must_use]
pub fn op(ctx: &Arc<BootContext>, step: StepName) -> Op {
    match step {
        StepName::LvmActivate => run(ctx, crypt::lvm_activate),
        StepName::MountTmpfs => run(ctx, mounts::mount_tmpfs),
        StepName::MountState => run(ctx, mounts::mount_state),
        StepName::DiscoverState => run(ctx, mounts::discover_state),
        StepName::MountRoot => run(ctx, mounts::mount_root),
        StepName::KcryptUpgrade => run(ctx, crypt::kcrypt_upgrade),
        StepName::KcryptUnlock => run(ctx, crypt::kcrypt_unlock),
        StepName::MountOem => run(ctx, mounts::mount_oem),
        StepName::RootfsHook => run(ctx, hooks::rootfs_hook),
        StepName::InitramfsHook => run(ctx, hooks::initramfs_hook),
        StepName::LoadConfig => run(ctx, mounts::load_config),
        StepName::MountBaseOverlay => run(ctx, mounts::mount_base_overlay),
        StepName::OverlayMount => run(ctx, mounts::overlay_mount),
        StepName::CustomMounts => run(ctx, mounts::custom_mounts),
        StepName::MountBind => run(ctx, mounts::mount_bind),
        StepName::WriteFstab => run(ctx, mounts::write_fstab),
        StepName::WriteSentinel => run(ctx, hooks::write_sentinel),
        StepName::WaitForSysroot => run(ctx, mounts::wait_for_sysroot),
        StepName::UkiBaseMounts => run(ctx, uki::uki_base_mounts),
        StepName::UkiPivotToSysroot => run(ctx, uki::uki_pivot_to_sysroot),
        StepName::UkiKernelModules => run(ctx, uki::uki_kernel_modules),
        StepName::UkiUdev => run(ctx, uki::uki_udev),
        StepName::UkiMountLivecd => {
            let ctx2 = Arc::clone(ctx);
            run(ctx, uki::uki_mount_livecd).enable_if(move || blockdev::is_removable_boot(&ctx2))
        }
        StepName::UkiMountEsp => run(ctx, uki::uki_mount_esp),
        StepName::UkiUnlock => {
            let ctx2 = Arc::clone(ctx);
            run(ctx, crypt::uki_unlock).enable_if(move || !blockdev::is_removable_boot(&ctx2))
        }
        StepName::UkiCopySysext => {
            let ctx2 = Arc::clone(ctx);
            run(ctx, uki::uki_copy_sysext).enable_if(move || {
                ctx2.mode != BootMode::Uki || !blockdev::is_removable_boot(&ctx2)
            })
        }
        StepName::UkiInit => run(ctx, uki::uki_init),
    }
}

fn run<F, Fut>(ctx: &Arc<BootContext>, body: F) -> Op
where
    F: Fn(Arc<BootContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ImmucoreResult<()>> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    Op::new().callback(move || body(Arc::clone(&ctx)))
}
