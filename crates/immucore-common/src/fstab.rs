//! fstab entries and the path rules used to produce them.

use std::fmt;
use std::path::{Path, PathBuf};

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Device or pseudo source.
    pub spec: String,
    /// Mountpoint as seen after the pivot.
    pub file: String,
    /// Filesystem type.
    pub vfstype: String,
    /// Mount options, bare keys or `key=value`.
    pub mntops: Vec<String>,
    /// dump frequency.
    pub freq: u32,
    /// fsck pass number.
    pub passno: u32,
}

impl FstabEntry {
    /// Entry with `0 0` dump/pass fields.
    pub fn new(
        spec: impl Into<String>,
        file: impl Into<String>,
        vfstype: impl Into<String>,
        mntops: Vec<String>,
    ) -> Self {
        Self {
            spec: spec.into(),
            file: file.into(),
            vfstype: vfstype.into(),
            mntops,
            freq: 0,
            passno: 0,
        }
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = if self.mntops.is_empty() {
            "defaults".to_string()
        } else {
            self.mntops.join(",")
        };
        write!(
            f,
            "{} {} {} {} {} {}",
            self.spec, self.file, self.vfstype, options, self.freq, self.passno
        )
    }
}

/// Remove the `rootdir` prefix from an absolute path.
///
/// Paths outside `rootdir`, and anything when `rootdir` is `/`, are returned
/// unchanged. `rootdir` itself maps to `/`.
#[must_use]
pub fn strip_rootdir(rootdir: &Path, path: &str) -> String {
    if rootdir == Path::new("/") || rootdir.as_os_str().is_empty() {
        return path.to_string();
    }
    match Path::new(path).strip_prefix(rootdir) {
        Ok(rest) if rest.as_os_str().is_empty() => "/".to_string(),
        Ok(rest) => format!("/{}", rest.display()),
        Err(_) => path.to_string(),
    }
}

/// Join an absolute mountpoint below `rootdir`.
#[must_use]
pub fn under_rootdir(rootdir: &Path, mountpoint: &str) -> PathBuf {
    rootdir.join(mountpoint.trim_start_matches('/'))
}

/// Resolve `LABEL=`/`UUID=` specs to their `/dev/disk` symlink.
#[must_use]
pub fn parse_mount(spec: &str) -> String {
    if let Some(label) = spec.strip_prefix("LABEL=") {
        format!("/dev/disk/by-label/{label}")
    } else if let Some(uuid) = spec.strip_prefix("UUID=") {
        format!("/dev/disk/by-uuid/{uuid}")
    } else {
        spec.to_string()
    }
}

/// Flatten a mountpoint into a single path component: `/var/lib/x` -> `var-lib-x`.
#[must_use]
pub fn flatten_path(mountpoint: &str) -> String {
    mountpoint
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Render a list of entries as fstab text.
#[must_use]
pub fn render(entries: &[FstabEntry]) -> String {
    entries.iter().map(|entry| format!("{entry}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_mount_specs() {
        assert_eq!(parse_mount("LABEL=MY_LABEL"), "/dev/disk/by-label/MY_LABEL");
        assert_eq!(parse_mount("UUID=9999"), "/dev/disk/by-uuid/9999");
        assert_eq!(parse_mount("/dev/sda1"), "/dev/sda1");
    }

    #[test]
    fn flatten() {
        assert_eq!(flatten_path("/var/lib/rancher"), "var-lib-rancher");
        assert_eq!(flatten_path("/etc"), "etc");
        assert_eq!(flatten_path("/usr/local/"), "usr-local");
    }

    #[test]
    fn strip() {
        let root = Path::new("/sysroot");
        assert_eq!(strip_rootdir(root, "/sysroot/oem"), "/oem");
        assert_eq!(strip_rootdir(root, "/sysroot"), "/");
        assert_eq!(strip_rootdir(root, "/sysroot/"), "/");
        assert_eq!(strip_rootdir(root, "/sysrootfoo"), "/sysrootfoo");
        assert_eq!(strip_rootdir(root, "/dev/disk/by-label/COS_OEM"), "/dev/disk/by-label/COS_OEM");
        assert_eq!(strip_rootdir(Path::new("/"), "/oem"), "/oem");
    }

    #[test]
    fn entry_display() {
        let entry = FstabEntry::new(
            "/dev/disk/by-label/COS_OEM",
            "/oem",
            "ext4",
            vec!["rw".to_string(), "suid".to_string()],
        );
        assert_eq!(entry.to_string(), "/dev/disk/by-label/COS_OEM /oem ext4 rw,suid 0 0");

        let bare = FstabEntry::new("tmpfs-tmp", "/tmp", "tmpfs", Vec::new());
        assert_eq!(bare.to_string(), "tmpfs-tmp /tmp tmpfs defaults 0 0");
    }

    proptest! {
        #[test]
        fn strip_then_prefix_roundtrips(parts in proptest::collection::vec("[a-z0-9_.-]{1,8}", 0..5), trailing in any::<bool>()) {
            let rootdir = Path::new("/sysroot");
            let mut path = format!("/sysroot/{}", parts.join("/"));
            if trailing {
                path.push('/');
            }
            let stripped = strip_rootdir(rootdir, &path);
            prop_assert!(stripped.starts_with('/'));
            let rebuilt = under_rootdir(rootdir, &stripped);
            prop_assert_eq!(rebuilt, PathBuf::from(&path).components().collect::<PathBuf>());
        }
    }
}
