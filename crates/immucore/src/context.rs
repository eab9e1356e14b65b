//! Boot context: mode selection and everything a step needs at hand.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use immucore_common::fstab::{flatten_path, strip_rootdir, under_rootdir};
use immucore_common::{BootPaths, Cmdline, FstabEntry, ImmucoreError, ImmucoreResult};
use tokio_util::sync::CancellationToken;

use crate::host::Host;
use crate::state::BootState;

/// Which pipeline drives this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Installed system: state partition, loop image, overlays.
    Normal,
    /// Live media or netboot: the root is provided by someone else.
    Live,
    /// Unified kernel image: everything happens in the initramfs root.
    Uki,
}

impl BootMode {
    /// Pick the pipeline for a cmdline. UKI wins over the disable flags.
    #[must_use]
    pub fn detect(cmdline: &Cmdline) -> Self {
        if cmdline.is_uki() {
            Self::Uki
        } else if cmdline.is_disabled() {
            Self::Live
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Live => write!(f, "live"),
            Self::Uki => write!(f, "uki"),
        }
    }
}

/// Default pause between mount retries.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default polling period for conditions such as the live sysroot.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default budget for a single mount.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything a step callback can reach.
#[derive(Debug)]
pub struct BootContext {
    /// Shared mutable state.
    pub state: BootState,
    /// Kernel cmdline oracle.
    pub cmdline: Cmdline,
    /// Host-level locations.
    pub paths: BootPaths,
    /// Side-effect boundary.
    pub host: Arc<dyn Host>,
    /// Global cancellation.
    pub cancel: CancellationToken,
    /// Selected pipeline.
    pub mode: BootMode,
    /// Pause before each mount attempt.
    pub settle_delay: Duration,
    /// Polling period.
    pub poll_interval: Duration,
    /// Retry budget of a mount that sets none of its own.
    pub mount_timeout: Duration,
}

impl BootContext {
    /// Build the context for the current cmdline.
    ///
    /// Fails with [`ImmucoreError::MissingTargetImage`] on a normal boot
    /// without `cos-img/filename`.
    pub fn new(cmdline: Cmdline, paths: BootPaths, host: Arc<dyn Host>) -> ImmucoreResult<Self> {
        let mode = BootMode::detect(&cmdline);
        let target_image = cmdline.target_image();

        if mode == BootMode::Normal && target_image.is_none() {
            return Err(ImmucoreError::MissingTargetImage);
        }

        let rootdir = match mode {
            BootMode::Uki => paths.root.clone(),
            BootMode::Normal | BootMode::Live => paths.host("/sysroot"),
        };
        let target_device = paths
            .dev_disk()
            .join("by-label")
            .join(image_label(target_image.as_deref()))
            .display()
            .to_string();

        tracing::debug!(
            %mode,
            rootdir = %rootdir.display(),
            image = ?target_image,
            device = %target_device,
            "Boot context ready"
        );

        Ok(Self {
            state: BootState::new(rootdir, target_image, target_device, cmdline.root_mode()),
            cmdline,
            paths,
            host,
            cancel: CancellationToken::new(),
            mode,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        })
    }

    /// Override the pause before each mount attempt.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Override the polling period.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the default mount budget.
    #[must_use]
    pub const fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Staging root of the final filesystem.
    #[must_use]
    pub fn rootdir(&self) -> &Path {
        &self.state.rootdir
    }

    /// `mountpoint` below the staging root.
    #[must_use]
    pub fn in_root(&self, mountpoint: &str) -> PathBuf {
        under_rootdir(self.rootdir(), mountpoint)
    }

    /// Label of the partition holding the root images.
    #[must_use]
    pub fn state_label(&self) -> &'static str {
        match image_name(self.state.target_image.as_deref()) {
            Some("recovery.img") => "COS_RECOVERY",
            _ => "COS_STATE",
        }
    }

    /// Where the state partition is mounted.
    #[must_use]
    pub fn state_mountpoint(&self) -> PathBuf {
        self.in_root("/run/initramfs/cos-state")
    }

    /// `/dev/disk/by-label/<label>` on this host.
    #[must_use]
    pub fn by_label(&self, label: &str) -> String {
        self.paths
            .dev_disk()
            .join("by-label")
            .join(label)
            .display()
            .to_string()
    }

    /// Resolve `LABEL=`/`UUID=` specs against this host's `/dev/disk`.
    #[must_use]
    pub fn resolve_spec(&self, spec: &str) -> String {
        if let Some(label) = spec.strip_prefix("LABEL=") {
            self.by_label(label)
        } else if let Some(uuid) = spec.strip_prefix("UUID=") {
            self.paths
                .dev_disk()
                .join("by-uuid")
                .join(uuid)
                .display()
                .to_string()
        } else {
            spec.to_string()
        }
    }

    /// Path as the pivoted system will see it.
    #[must_use]
    pub fn normalize(&self, path: &str) -> String {
        let stripped = strip_rootdir(self.rootdir(), path);
        if stripped == path {
            strip_rootdir(&self.paths.root, path)
        } else {
            stripped
        }
    }

    /// fstab entry for a mount of `source` on `target`, paths normalized.
    #[must_use]
    pub fn fstab_entry(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> FstabEntry {
        FstabEntry::new(
            self.normalize(source),
            self.normalize(&target.display().to_string()),
            fstype,
            options.to_vec(),
        )
    }

    /// Name used as fstab spec for a source-less mount.
    #[must_use]
    pub fn virtual_source(&self, fstype: &str, target: &Path) -> String {
        let file = self.normalize(&target.display().to_string());
        let flat = flatten_path(&file);
        if flat.is_empty() {
            format!("{fstype}-root")
        } else {
            format!("{fstype}-{flat}")
        }
    }
}

fn image_name(image: Option<&str>) -> Option<&str> {
    image.and_then(|path| Path::new(path).file_name()?.to_str())
}

/// Label carried by the filesystem inside a root image.
fn image_label(image: Option<&str>) -> &'static str {
    match image_name(image) {
        Some("recovery.img") => "COS_SYSTEM",
        Some("passive.img") => "COS_PASSIVE",
        _ => "COS_ACTIVE",
    }
}
