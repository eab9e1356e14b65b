//! Bind mounts redirecting rootfs paths to persistent state.

use std::path::Path;

use immucore_common::fstab::flatten_path;

use crate::context::BootContext;
use crate::filesystem::mounts::{MountKind, MountOperation};

/// Bind `<rootdir>/<state_dir>/<flattened>.bind` over `<rootdir>/<mountpoint>`.
pub fn bind_mount(ctx: &BootContext, mountpoint: &str, state_dir: &str) -> MountOperation {
    let target = ctx.in_root(mountpoint);
    let state_path = ctx
        .in_root(state_dir)
        .join(format!("{}.bind", flatten_path(mountpoint)));
    let source = state_path.display().to_string();

    let mut op = MountOperation::new(
        ctx,
        source,
        target,
        "none",
        vec!["defaults".to_string(), "bind".to_string()],
    );
    op.kind = MountKind::Bind { state_path };
    op
}

fn depth(path: &str) -> usize {
    Path::new(path)
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .count()
}

/// Drop empty and duplicate entries, then order shallow-first and
/// lexicographically within a depth so parents are bound before children.
#[must_use]
pub fn sort_bind_mounts(mounts: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = mounts
        .iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    sorted.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
    sorted.dedup();
    sorted
}
