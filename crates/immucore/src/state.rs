//! Shared boot state threaded through every step.

use std::collections::BTreeMap;
use std::path::PathBuf;

use immucore_common::{FstabEntry, RootMode};
use parking_lot::{Mutex, RwLock};

/// Default `PERSISTENT_STATE_TARGET`.
pub const DEFAULT_STATE_DIR: &str = "/usr/local/.state";

/// Paths overlaid with a writable layer when the layout file names none.
pub const DEFAULT_RW_PATHS: &[&str] = &["/etc", "/root", "/home", "/opt", "/srv", "/usr/local", "/var"];

/// Rootfs composition read from `cos-layout.env` and the cmdline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Paths to cover with an overlay, in order.
    pub overlay_dirs: Vec<String>,
    /// Paths to redirect to persistent state.
    pub bind_mounts: Vec<String>,
    /// Device spec to mountpoint.
    pub custom_mounts: BTreeMap<String, String>,
    /// `tmpfs:<size>`, `LABEL=<l>` or `UUID=<u>`.
    pub overlay_base_spec: String,
    /// Directory under the rootfs backing the bind mounts.
    pub state_dir: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            overlay_dirs: Vec::new(),
            bind_mounts: Vec::new(),
            custom_mounts: BTreeMap::new(),
            overlay_base_spec: immucore_common::cmdline::DEFAULT_OVERLAY_BASE.to_string(),
            state_dir: DEFAULT_STATE_DIR.to_string(),
        }
    }
}

/// The record every step reads from and writes to.
#[derive(Debug)]
pub struct BootState {
    /// Where the final rootfs is staged.
    pub rootdir: PathBuf,
    /// Image inside the state partition, e.g. `/cOS/active.img`.
    pub target_image: Option<String>,
    /// Label path of the image's loop device.
    pub target_device: String,
    /// Root mount mode from the cmdline.
    pub root_mode: RootMode,
    layout: RwLock<Layout>,
    fstabs: Mutex<Vec<FstabEntry>>,
}

impl BootState {
    /// Fresh state with an empty layout.
    pub fn new(
        rootdir: impl Into<PathBuf>,
        target_image: Option<String>,
        target_device: impl Into<String>,
        root_mode: RootMode,
    ) -> Self {
        Self {
            rootdir: rootdir.into(),
            target_image,
            target_device: target_device.into(),
            root_mode,
            layout: RwLock::new(Layout::default()),
            fstabs: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current layout.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout.read().clone()
    }

    /// Replace the layout.
    pub fn set_layout(&self, layout: Layout) {
        *self.layout.write() = layout;
    }

    /// Append an fstab entry unless one with the same spec is present.
    ///
    /// Returns whether the entry was added.
    pub fn record_fstab(&self, entry: FstabEntry) -> bool {
        let mut fstabs = self.fstabs.lock();
        if fstabs.iter().any(|existing| existing.spec == entry.spec) {
            tracing::trace!(spec = %entry.spec, "Fstab entry already recorded");
            return false;
        }
        tracing::debug!(entry = %entry, "Recording fstab entry");
        fstabs.push(entry);
        true
    }

    /// Entries recorded so far, in completion order.
    #[must_use]
    pub fn fstabs(&self) -> Vec<FstabEntry> {
        self.fstabs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state() -> BootState {
        BootState::new("/sysroot", None, "", RootMode::ReadOnly)
    }

    #[test]
    fn layout_defaults() {
        let layout = state().layout();
        assert_eq!(layout.overlay_base_spec, "tmpfs:20%");
        assert_eq!(layout.state_dir, "/usr/local/.state");
        assert!(layout.overlay_dirs.is_empty());
    }

    #[test]
    fn duplicate_spec_is_dropped() {
        let state = state();
        assert!(state.record_fstab(FstabEntry::new("tmpfs-tmp", "/tmp", "tmpfs", Vec::new())));
        assert!(!state.record_fstab(FstabEntry::new(
            "tmpfs-tmp",
            "/other",
            "tmpfs",
            Vec::new()
        )));
        assert_eq!(state.fstabs().len(), 1);
        assert_eq!(state.fstabs()[0].file, "/tmp");
    }

    proptest! {
        #[test]
        fn fstabs_never_repeat_a_spec(specs in proptest::collection::vec("[a-c]{1,2}", 0..30)) {
            let state = state();
            for (i, spec) in specs.iter().enumerate() {
                state.record_fstab(FstabEntry::new(spec.clone(), format!("/m{i}"), "ext4", Vec::new()));
            }
            let recorded = state.fstabs();
            let mut seen = std::collections::HashSet::new();
            for entry in &recorded {
                prop_assert!(seen.insert(entry.spec.clone()));
            }
            let distinct: std::collections::HashSet<_> = specs.iter().collect();
            prop_assert_eq!(recorded.len(), distinct.len());
        }
    }
}
