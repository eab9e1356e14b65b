//! Live media and netboot: the root is assembled by someone else and only
//! the hooks run.

use super::{Policy, Wiring};
use crate::steps::StepName::{InitramfsHook, MountOem, RootfsHook, WaitForSysroot, WriteSentinel};

/// Live boot wiring.
pub const WIRING: &[Wiring] = &[
    Wiring::step(WriteSentinel).policy(Policy::Return),
    Wiring::step(WaitForSysroot),
    Wiring::step(MountOem).after(&[WaitForSysroot]),
    Wiring::step(RootfsHook)
        .after(&[WriteSentinel, WaitForSysroot])
        .after_weak(&[MountOem]),
    Wiring::step(InitramfsHook)
        .after(&[WriteSentinel, WaitForSysroot, RootfsHook])
        .after_weak(&[MountOem]),
];
