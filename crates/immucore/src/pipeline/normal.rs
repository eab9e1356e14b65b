//! Installed-system boot: state partition, loop-mounted image, overlays.

use super::{Policy, Wiring};
use crate::steps::StepName::{
    CustomMounts, DiscoverState, InitramfsHook, KcryptUnlock, KcryptUpgrade, LoadConfig,
    LvmActivate, MountBaseOverlay, MountBind, MountOem, MountRoot, MountState, MountTmpfs,
    OverlayMount, RootfsHook, UkiCopySysext, WriteFstab, WriteSentinel,
};

/// Normal boot wiring.
///
/// write-fstab only orders itself after its contributors so a boot with a
/// broken state partition still ends up with an fstab.
pub const WIRING: &[Wiring] = &[
    Wiring::step(LvmActivate),
    Wiring::step(WriteSentinel)
        .after(&[LvmActivate])
        .policy(Policy::Return),
    Wiring::step(MountTmpfs).background(),
    Wiring::step(MountState),
    Wiring::step(DiscoverState).after(&[MountState]),
    Wiring::step(MountRoot).after(&[DiscoverState]),
    Wiring::step(KcryptUpgrade).after(&[MountRoot]),
    Wiring::step(KcryptUnlock).after(&[MountRoot, KcryptUpgrade]),
    Wiring::step(MountOem)
        .after(&[MountRoot])
        .after_weak(&[LvmActivate]),
    Wiring::step(RootfsHook).after(&[MountRoot, MountOem, WriteSentinel]),
    Wiring::step(LoadConfig).after(&[RootfsHook]),
    Wiring::step(MountBaseOverlay).after(&[LoadConfig]),
    Wiring::step(OverlayMount)
        .after(&[LoadConfig])
        .after_weak(&[MountBaseOverlay]),
    Wiring::step(CustomMounts).after(&[LoadConfig]),
    Wiring::step(MountBind).after(&[CustomMounts, LoadConfig]),
    Wiring::step(UkiCopySysext).after_weak(&[MountBind]),
    Wiring::step(WriteFstab)
        .after_weak(&[
            MountRoot,
            DiscoverState,
            LoadConfig,
            KcryptUnlock,
            MountOem,
            CustomMounts,
            MountBind,
            OverlayMount,
        ])
        .wait_background(),
    Wiring::step(InitramfsHook)
        .after(&[MountRoot, DiscoverState, LoadConfig, WriteFstab])
        .after_weak(&[
            MountBaseOverlay,
            KcryptUnlock,
            MountOem,
            MountBind,
            CustomMounts,
            OverlayMount,
        ]),
];
