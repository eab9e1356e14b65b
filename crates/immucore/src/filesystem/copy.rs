//! Archive-style tree copy.
//!
//! Copies files, directories and symlinks, keeping permission bits and,
//! where the process may, ownership.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown, symlink};
use std::path::Path;

use walkdir::WalkDir;

/// Copy the contents of `src` into `dst`, which is created if missing.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let dst_path = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&dst_path);
            symlink(&link_target, &dst_path)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            // Applied last so read-only directories can still be filled.
            dirs.push((entry.into_path(), dst_path));
            continue;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dst_path)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        }

        preserve(entry.path(), &dst_path, file_type.is_symlink())?;
    }

    for (src_dir, dst_dir) in dirs.iter().rev() {
        preserve(src_dir, dst_dir, false)?;
    }
    preserve(src, dst, false)
}

/// Copy mode and ownership from `src` to `dst`.
fn preserve(src: &Path, dst: &Path, is_symlink: bool) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !is_symlink {
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode()))?;
    }
    if let Err(e) = lchown(dst, Some(meta.uid()), Some(meta.gid())) {
        // Unprivileged copies keep the caller's ownership.
        if e.kind() != io::ErrorKind::PermissionDenied {
            return Err(e);
        }
    }
    Ok(())
}
