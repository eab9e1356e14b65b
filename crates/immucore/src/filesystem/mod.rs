//! Filesystem composition.
//!
//! This module handles:
//! - The retrying mount primitive and its fstab bookkeeping
//! - Overlay and bind mount constructors
//! - UKI baseline mounts
//! - Relocating the initramfs root into a new sysroot

pub mod bind;
pub mod copy;
pub mod mounts;
pub mod overlay;
pub mod pivot;
pub mod rootfs;

pub use bind::{bind_mount, sort_bind_mounts};
pub use mounts::{MountKind, MountOperation, mount, mount_with_fstab};
pub use overlay::{base_overlay, mount_with_base_overlay};
