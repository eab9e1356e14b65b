//! Boot-state sentinels under `/run/cos`.

use std::fmt;
use std::path::Path;

use immucore_common::ImmucoreResult;

use crate::context::{BootContext, BootMode};
use crate::system::{blockdev, efi};

/// What kind of system is booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// Installed system, active image.
    Active,
    /// Installed system, fallback image.
    Passive,
    /// Recovery image.
    Recovery,
    /// Recovery image asked to reset the system.
    Autoreset,
    /// Live media, netboot or install media.
    LiveCd,
    /// Could not be determined.
    Unknown,
}

impl Sentinel {
    /// Sentinel file name.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Active => "active_mode",
            Self::Passive => "passive_mode",
            Self::Recovery => "recovery_mode",
            Self::Autoreset => "autoreset_mode",
            Self::LiveCd => "live_mode",
            Self::Unknown => "unknown",
        }
    }

    /// Directory below `/.extra/sysext` holding this state's extensions.
    #[must_use]
    pub const fn sysext_dir(self) -> Option<&'static str> {
        match self {
            Self::Active => Some("active"),
            Self::Passive => Some("passive"),
            Self::Recovery | Self::Autoreset => Some("recovery"),
            Self::LiveCd | Self::Unknown => None,
        }
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Inspect the cmdline and firmware to find the boot state.
#[must_use]
pub fn detect(ctx: &BootContext) -> Sentinel {
    if ctx.cmdline.is_disabled() {
        return Sentinel::LiveCd;
    }
    match ctx.mode {
        BootMode::Uki => detect_uki(ctx),
        BootMode::Normal | BootMode::Live => detect_image(ctx),
    }
}

fn detect_uki(ctx: &BootContext) -> Sentinel {
    if blockdev::is_removable_boot(ctx) {
        return Sentinel::LiveCd;
    }
    if let Some(entry) = efi::loader_entry_selected(&ctx.paths) {
        if entry.contains("statereset") || entry.contains("autoreset") {
            return Sentinel::Autoreset;
        }
        if entry.contains("recovery") {
            return Sentinel::Recovery;
        }
        if entry.contains("passive") {
            return Sentinel::Passive;
        }
        if entry.contains("active") {
            return Sentinel::Active;
        }
    }
    if ctx.cmdline.has("recovery-mode") {
        return Sentinel::Recovery;
    }
    Sentinel::Unknown
}

fn detect_image(ctx: &BootContext) -> Sentinel {
    let image = ctx
        .state
        .target_image
        .as_deref()
        .and_then(|image| Path::new(image).file_name()?.to_str());
    match image {
        Some("active.img") => Sentinel::Active,
        Some("passive.img") => Sentinel::Passive,
        Some("recovery.img") if ctx.cmdline.has("kairos.reset") => Sentinel::Autoreset,
        Some("recovery.img") => Sentinel::Recovery,
        _ => Sentinel::Unknown,
    }
}

/// Write the boot-state sentinel, plus the UKI boot/install marker.
pub fn write(ctx: &BootContext) -> ImmucoreResult<Sentinel> {
    let dir = ctx.paths.sentinel_dir();
    std::fs::create_dir_all(&dir)?;

    let state = detect(ctx);
    std::fs::write(ctx.paths.sentinel(state.file_name()), "1")?;
    tracing::info!(%state, "Wrote boot sentinel");

    if ctx.mode == BootMode::Uki {
        let marker = if blockdev::is_removable_boot(ctx) {
            "uki_install_mode"
        } else {
            "uki_boot_mode"
        };
        std::fs::write(ctx.paths.sentinel(marker), "1")?;
        tracing::info!(%marker, "Wrote UKI sentinel");
    }
    Ok(state)
}
