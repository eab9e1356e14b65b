//! Switching a UKI boot over to a freshly built sysroot.
//!
//! The initramfs root cannot be pivoted away from directly, so its content is
//! rebuilt inside a tmpfs: plain directories are recreated and their files
//! copied, mountpoints are moved across, and the tmpfs is then moved onto `/`.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use immucore_common::{ImmucoreError, ImmucoreResult};
use walkdir::WalkDir;

use crate::context::BootContext;
use crate::host::CommandSpec;

/// One action needed to rebuild a tree inside the new sysroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// Directory on the same device as its parent.
    Directory(PathBuf),
    /// Regular file.
    File(PathBuf),
    /// Symbolic link and its target.
    Symlink(PathBuf, PathBuf),
    /// Directory on another device: a mountpoint to move.
    Mountpoint(PathBuf),
}

/// Plan the relocation of `root` into `sysroot`, which is skipped.
///
/// Paths in the plan are relative to `root`.
pub fn plan(root: &Path, sysroot: &Path) -> io::Result<Vec<Relocation>> {
    plan_with(root, sysroot, |path| fs::symlink_metadata(path).map(|m| m.dev()))
}

/// [`plan`] with a custom device lookup.
pub fn plan_with<F>(root: &Path, sysroot: &Path, device_of: F) -> io::Result<Vec<Relocation>>
where
    F: Fn(&Path) -> io::Result<u64>,
{
    let mut plan = Vec::new();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(io::Error::other)?.to_path_buf();
        let file_type = entry.file_type();

        if path == sysroot {
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_symlink() {
            plan.push(Relocation::Symlink(relative, fs::read_link(path)?));
        } else if file_type.is_dir() {
            let parent = path.parent().unwrap_or(root);
            if device_of(path)? == device_of(parent)? {
                plan.push(Relocation::Directory(relative));
            } else {
                plan.push(Relocation::Mountpoint(relative));
                walker.skip_current_dir();
            }
        } else if file_type.is_file() {
            plan.push(Relocation::File(relative));
        }
    }

    Ok(plan)
}

/// Rebuild `root` inside `sysroot` according to `plan`.
///
/// Copies first, then moves every mountpoint.
pub fn relocate(
    ctx: &BootContext,
    root: &Path,
    sysroot: &Path,
    plan: &[Relocation],
) -> ImmucoreResult<()> {
    let mut mountpoints = Vec::new();

    for step in plan {
        match step {
            Relocation::Directory(rel) => {
                let dst = sysroot.join(rel);
                fs::create_dir_all(&dst)?;
                let mode = fs::symlink_metadata(root.join(rel))?.mode();
                fs::set_permissions(&dst, fs::Permissions::from_mode(mode))?;
            }
            Relocation::File(rel) => {
                fs::copy(root.join(rel), sysroot.join(rel))?;
            }
            Relocation::Symlink(rel, target) => {
                let dst = sysroot.join(rel);
                let _ = fs::remove_file(&dst);
                symlink(target, &dst)?;
            }
            Relocation::Mountpoint(rel) => mountpoints.push(rel),
        }
    }

    for rel in mountpoints {
        let (from, to) = (root.join(rel), sysroot.join(rel));
        fs::create_dir_all(&to)?;
        tracing::debug!(from = %from.display(), to = %to.display(), "Moving mountpoint");
        ctx.host.move_mount(&from, &to)?;
    }

    Ok(())
}

/// Make `<rootdir>/sysroot` a tmpfs. An existing mount is reused.
pub fn stage_sysroot(ctx: &BootContext) -> ImmucoreResult<PathBuf> {
    let sysroot = ctx.in_root("/sysroot");
    fs::create_dir_all(&sysroot)?;

    let request = crate::host::MountRequest {
        source: "tmpfs".to_string(),
        target: sysroot.clone(),
        fstype: "tmpfs".to_string(),
        options: vec!["mode=0755".to_string()],
    };
    match ctx.host.mount(&request) {
        Ok(()) => tracing::debug!(sysroot = %sysroot.display(), "Staged sysroot tmpfs"),
        Err(e) if e.is_already_mounted() => {}
        Err(e) => return Err(e),
    }
    Ok(sysroot)
}

/// Everything up to, but excluding, executing the new init.
pub async fn switch_to_sysroot(ctx: &BootContext) -> ImmucoreResult<()> {
    let pcrphase = CommandSpec::new(crate::system::efi::PCRPHASE).arg("leave-initrd");
    ctx.host.run_checked(&pcrphase).await?;

    for dir in ctx.state.layout().overlay_dirs {
        ctx.host.make_shared(&ctx.in_root(&dir), true)?;
    }

    let root = ctx.rootdir().to_path_buf();
    let sysroot = if ctx.host.is_mounted(&ctx.in_root("/sysroot")) {
        ctx.in_root("/sysroot")
    } else {
        stage_sysroot(ctx)?
    };

    let plan = plan(&root, &sysroot)?;
    tracing::info!(entries = plan.len(), sysroot = %sysroot.display(), "Relocating root");
    relocate(ctx, &root, &sysroot, &plan)?;

    ctx.host.remount_readonly(&sysroot)?;
    ctx.host.switch_root(&sysroot)
}

/// Hand over to the real init, falling back to a shell.
///
/// Only returns for hosts that do not replace the process.
pub fn exec_init(ctx: &BootContext) -> ImmucoreResult<()> {
    match ctx.host.exec("/sbin/init", &[]) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "Could not execute /sbin/init");
            emergency_shell(ctx, e)
        }
    }
}

/// Replace the process with `/bin/bash`.
pub fn emergency_shell(ctx: &BootContext, cause: ImmucoreError) -> ImmucoreResult<()> {
    tracing::error!(cause = %cause, "Dropping to emergency shell");
    ctx.host.exec("/bin/bash", &["-l"]).map_err(|e| ImmucoreError::Pivot {
        message: format!("{cause}; emergency shell failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use immucore_common::{BootPaths, Cmdline};
    use tempfile::tempdir;

    use super::*;
    use crate::host::fake::RecordingHost;

    /// Scratch tree where `mounted/` and `run/nested/` pretend to be other devices.
    fn scratch() -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/hostname"), "initrd\n").unwrap();
        fs::create_dir_all(root.join("mounted/inner")).unwrap();
        fs::write(root.join("mounted/inner/data"), "x").unwrap();
        fs::create_dir_all(root.join("run/nested/deep")).unwrap();
        fs::create_dir_all(root.join("run/plain")).unwrap();
        fs::create_dir_all(root.join("sysroot/old")).unwrap();
        fs::write(root.join("init"), "#!/bin/sh\n").unwrap();
        symlink("usr/bin", root.join("bin")).unwrap();
        temp
    }

    fn fake_devices(root: &Path) -> impl Fn(&Path) -> io::Result<u64> + '_ {
        move |path| {
            let rel = path.strip_prefix(root).unwrap_or(path);
            Ok(if rel.starts_with("mounted") {
                2
            } else if rel.starts_with("run/nested") {
                3
            } else {
                1
            })
        }
    }

    #[test]
    fn mountpoints_are_detected_by_device() {
        let temp = scratch();
        let root = temp.path();
        let plan = plan_with(root, &root.join("sysroot"), fake_devices(root)).unwrap();

        assert_eq!(
            plan,
            vec![
                Relocation::Symlink(PathBuf::from("bin"), PathBuf::from("usr/bin")),
                Relocation::Directory(PathBuf::from("etc")),
                Relocation::File(PathBuf::from("etc/hostname")),
                Relocation::File(PathBuf::from("init")),
                Relocation::Mountpoint(PathBuf::from("mounted")),
                Relocation::Directory(PathBuf::from("run")),
                Relocation::Mountpoint(PathBuf::from("run/nested")),
                Relocation::Directory(PathBuf::from("run/plain")),
            ]
        );
    }

    #[test]
    fn real_tree_has_no_mountpoints() {
        let temp = scratch();
        let root = temp.path();
        let plan = plan(root, &root.join("sysroot")).unwrap();
        assert!(!plan.iter().any(|r| matches!(r, Relocation::Mountpoint(_))));
        assert!(plan.contains(&Relocation::File(PathBuf::from("mounted/inner/data"))));
        assert!(!plan.iter().any(|r| matches!(r, Relocation::Directory(p) if p.starts_with("sysroot"))));
    }

    #[test]
    fn relocation_copies_and_moves() {
        let temp = scratch();
        let root = temp.path();
        let sysroot = root.join("sysroot");
        let host = Arc::new(RecordingHost::new());
        let ctx = BootContext::new(
            Cmdline::from_string("rd.immucore.uki"),
            BootPaths::with_root(root),
            host.clone(),
        )
        .unwrap();

        let plan = plan_with(root, &sysroot, fake_devices(root)).unwrap();
        relocate(&ctx, root, &sysroot, &plan).unwrap();

        assert_eq!(fs::read_to_string(sysroot.join("etc/hostname")).unwrap(), "initrd\n");
        assert_eq!(fs::read_link(sysroot.join("bin")).unwrap(), Path::new("usr/bin"));
        assert!(sysroot.join("run/plain").is_dir());
        assert!(sysroot.join("run/nested").is_dir());
        assert!(!sysroot.join("mounted/inner").exists());
        assert_eq!(
            host.events(),
            vec![
                format!("move {} {}", root.join("mounted").display(), sysroot.join("mounted").display()),
                format!(
                    "move {} {}",
                    root.join("run/nested").display(),
                    sysroot.join("run/nested").display()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn switch_runs_every_stage() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = BootContext::new(
            Cmdline::from_string("rd.immucore.uki"),
            BootPaths::with_root(root),
            host.clone(),
        )
        .unwrap();
        let mut layout = ctx.state.layout();
        layout.overlay_dirs = vec!["/etc".to_string()];
        ctx.state.set_layout(layout);

        switch_to_sysroot(&ctx).await.unwrap();
        exec_init(&ctx).unwrap();

        let sysroot = root.join("sysroot");
        assert!(host.ran("/usr/lib/systemd/systemd-pcrphase leave-initrd"));
        assert!(host.mounted_at(&sysroot).is_some());
        assert!(sysroot.join("etc").is_dir());
        let events = host.events();
        assert_eq!(events[0], format!("shared {} true", root.join("etc").display()));
        assert!(events.contains(&format!("remount-ro {}", sysroot.display())));
        assert!(events.contains(&format!("switch-root {}", sysroot.display())));
        assert_eq!(events.last().unwrap(), "exec /sbin/init");
    }
}
