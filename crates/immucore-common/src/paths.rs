//! Standard filesystem paths used during early boot.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Kernel cmdline source, overridable for tests through `HOST_PROC_CMDLINE`.
pub static CMDLINE_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HOST_PROC_CMDLINE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc/cmdline"))
});

/// Directories appended to `PATH` for every child process.
pub const CHILD_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin";

/// systemd-boot / firmware efivar vendor GUIDs.
const LOADER_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";
const GLOBAL_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// Host-level locations the orchestrator reads and writes.
///
/// Everything hangs off `root` so that a whole boot can be replayed in a
/// scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPaths {
    /// Root of the initramfs (default: /).
    pub root: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl BootPaths {
    /// Paths relative to `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths relative to a custom root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an absolute host path under the root.
    #[must_use]
    pub fn host(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let relative = absolute.as_ref().strip_prefix("/").unwrap_or(absolute.as_ref());
        self.root.join(relative)
    }

    /// Sentinel directory (`/run/cos`).
    #[must_use]
    pub fn sentinel_dir(&self) -> PathBuf {
        self.host("/run/cos")
    }

    /// Sentinel file for a boot state name.
    #[must_use]
    pub fn sentinel(&self, name: &str) -> PathBuf {
        self.sentinel_dir().join(name)
    }

    /// Log directory (`/run/immucore`).
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.host("/run/immucore")
    }

    /// Main log file.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("immucore.log")
    }

    /// Log file for a stage run.
    #[must_use]
    pub fn stage_log(&self, stage: &str) -> PathBuf {
        self.log_dir().join(format!("{stage}_stage.log"))
    }

    /// Backing store of the writable overlays (`/run/overlay`).
    #[must_use]
    pub fn overlay_base(&self) -> PathBuf {
        self.host("/run/overlay")
    }

    /// systemd-sysext directory (`/run/extensions`).
    #[must_use]
    pub fn extensions(&self) -> PathBuf {
        self.host("/run/extensions")
    }

    /// systemd runtime directory (`/run/systemd`).
    #[must_use]
    pub fn systemd_run(&self) -> PathBuf {
        self.host("/run/systemd")
    }

    /// UKI addon payload (`/.extra`).
    #[must_use]
    pub fn extra(&self) -> PathBuf {
        self.host("/.extra")
    }

    /// System extensions shipped inside the UKI.
    #[must_use]
    pub fn extra_sysext(&self) -> PathBuf {
        self.extra().join("sysext")
    }

    /// Device symlink directories (`/dev/disk`).
    #[must_use]
    pub fn dev_disk(&self) -> PathBuf {
        self.host("/dev/disk")
    }

    /// Block device class directory (`/sys/class/block`).
    #[must_use]
    pub fn sys_class_block(&self) -> PathBuf {
        self.host("/sys/class/block")
    }

    /// Device tree holding `modalias` files.
    #[must_use]
    pub fn sys_devices(&self) -> PathBuf {
        self.host("/sys/devices")
    }

    /// EFI variables directory.
    #[must_use]
    pub fn efivars(&self) -> PathBuf {
        self.host("/sys/firmware/efi/efivars")
    }

    /// systemd-boot variable by name.
    #[must_use]
    pub fn loader_var(&self, name: &str) -> PathBuf {
        self.efivars().join(format!("{name}-{LOADER_GUID}"))
    }

    /// Firmware `SecureBoot` variable.
    #[must_use]
    pub fn secure_boot_var(&self) -> PathBuf {
        self.efivars().join(format!("SecureBoot-{GLOBAL_GUID}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let paths = BootPaths::new();
        assert_eq!(paths.sentinel("active_mode"), PathBuf::from("/run/cos/active_mode"));
        assert_eq!(paths.log_file(), PathBuf::from("/run/immucore/immucore.log"));
        assert_eq!(
            paths.stage_log("rootfs"),
            PathBuf::from("/run/immucore/rootfs_stage.log")
        );
    }

    #[test]
    fn custom_root() {
        let paths = BootPaths::with_root("/scratch");
        assert_eq!(paths.overlay_base(), PathBuf::from("/scratch/run/overlay"));
        assert_eq!(paths.extra_sysext(), PathBuf::from("/scratch/.extra/sysext"));
        assert_eq!(
            paths.secure_boot_var(),
            PathBuf::from(
                "/scratch/sys/firmware/efi/efivars/SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c"
            )
        );
    }
}
