//! Unified kernel image boot: everything is composed inside the initramfs
//! root, which is then rebuilt in a tmpfs and switched to.

use super::{Policy, Wiring};
use crate::steps::StepName::{
    CustomMounts, InitramfsHook, LoadConfig, MountBaseOverlay, MountBind, MountOem, OverlayMount,
    RootfsHook, UkiBaseMounts, UkiCopySysext, UkiInit, UkiKernelModules, UkiMountEsp,
    UkiMountLivecd, UkiPivotToSysroot, UkiUdev, UkiUnlock, WriteFstab, WriteSentinel,
};

/// UKI boot wiring.
pub const WIRING: &[Wiring] = &[
    Wiring::step(UkiBaseMounts),
    Wiring::step(UkiPivotToSysroot).after(&[UkiBaseMounts]),
    Wiring::step(WriteSentinel)
        .after(&[UkiBaseMounts])
        .policy(Policy::Return),
    Wiring::step(UkiKernelModules).after(&[UkiBaseMounts]),
    Wiring::step(UkiUdev).after(&[UkiKernelModules]),
    Wiring::step(UkiMountEsp).after(&[WriteSentinel, UkiUdev]),
    Wiring::step(UkiMountLivecd).after(&[WriteSentinel, UkiUdev]),
    Wiring::step(RootfsHook)
        .after(&[WriteSentinel, UkiUdev])
        .after_weak(&[UkiMountLivecd]),
    Wiring::step(UkiUnlock).after(&[WriteSentinel, UkiUdev]),
    Wiring::step(MountOem).after(&[UkiUnlock]),
    Wiring::step(LoadConfig).after(&[RootfsHook]),
    Wiring::step(MountBaseOverlay).after(&[LoadConfig]),
    Wiring::step(OverlayMount).after_weak(&[LoadConfig, MountBaseOverlay]),
    Wiring::step(CustomMounts).after_weak(&[LoadConfig]),
    Wiring::step(MountBind).after_weak(&[LoadConfig]),
    Wiring::step(InitramfsHook).after(&[MountBind]),
    Wiring::step(WriteFstab).after(&[LoadConfig, CustomMounts, MountBind, OverlayMount]),
    Wiring::step(UkiCopySysext)
        .after(&[WriteSentinel])
        .after_weak(&[MountBind]),
    Wiring::step(UkiInit)
        .after(&[UkiBaseMounts])
        .after_weak(&[
            UkiPivotToSysroot,
            WriteSentinel,
            UkiKernelModules,
            UkiUdev,
            UkiMountEsp,
            UkiMountLivecd,
            RootfsHook,
            UkiUnlock,
            MountOem,
            LoadConfig,
            MountBaseOverlay,
            OverlayMount,
            CustomMounts,
            MountBind,
            InitramfsHook,
            WriteFstab,
            UkiCopySysext,
        ])
        .policy(Policy::Panic),
];
