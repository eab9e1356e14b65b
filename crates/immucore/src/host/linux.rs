//! [`Host`] backed by the running kernel.

use std::ffi::CString;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use immucore_common::paths::CHILD_PATH;
use immucore_common::{ImmucoreError, ImmucoreResult};
use rustix::mount::MountFlags;

use super::{CommandOutput, CommandSpec, Host, MountEntry, MountRequest};

/// Real host: `rustix` syscalls, `procfs` mount table, `tokio` processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl LinuxHost {
    /// New host handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Split fstab-style options into kernel flags and filesystem data.
#[must_use]
pub fn split_options(options: &[String]) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match option.as_str() {
            "ro" => flags |= MountFlags::RDONLY,
            "nosuid" => flags |= MountFlags::NOSUID,
            "nodev" => flags |= MountFlags::NODEV,
            "noexec" => flags |= MountFlags::NOEXEC,
            "sync" => flags |= MountFlags::SYNCHRONOUS,
            "noatime" => flags |= MountFlags::NOATIME,
            "nodiratime" => flags |= MountFlags::NODIRATIME,
            "relatime" => flags |= MountFlags::RELATIME,
            "strictatime" => flags |= MountFlags::STRICTATIME,
            "bind" => flags |= MountFlags::BIND,
            "rbind" => flags |= MountFlags::BIND | MountFlags::REC,
            // Defaults the kernel applies anyway.
            "rw" | "suid" | "dev" | "exec" | "async" | "defaults" => {}
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Inherited `PATH` extended with the standard system directories.
fn child_path() -> String {
    match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => format!("{existing}:{CHILD_PATH}"),
        _ => CHILD_PATH.to_string(),
    }
}

fn errno(e: rustix::io::Errno) -> ImmucoreError {
    ImmucoreError::Io(e.into())
}

#[async_trait]
impl Host for LinuxHost {
    fn mount(&self, request: &MountRequest) -> ImmucoreResult<()> {
        let (flags, data) = split_options(&request.options);

        tracing::debug!(
            source = %request.source,
            target = %request.target.display(),
            fstype = %request.fstype,
            ?flags,
            data = %data,
            "Mounting filesystem"
        );

        let data_c = CString::new(data).map_err(|_| {
            ImmucoreError::config(format!(
                "Invalid mount options for {} (contains null byte)",
                request.target.display()
            ))
        })?;

        match rustix::mount::mount(
            request.source.as_str(),
            &request.target,
            request.fstype.as_str(),
            flags,
            Some(data_c.as_c_str()),
        ) {
            Ok(()) => Ok(()),
            Err(e) if e == rustix::io::Errno::BUSY => Err(ImmucoreError::AlreadyMounted {
                target: request.target.clone(),
            }),
            Err(e) => Err(ImmucoreError::MountFailed {
                source_spec: request.source.clone(),
                target: request.target.clone(),
                message: std::io::Error::from(e).to_string(),
            }),
        }
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> ImmucoreResult<()> {
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            recursive,
            "Creating bind mount"
        );

        let result = if recursive {
            rustix::mount::mount_bind_recursive(source, target)
        } else {
            rustix::mount::mount_bind(source, target)
        };
        result.map_err(|e| ImmucoreError::MountFailed {
            source_spec: source.display().to_string(),
            target: target.to_path_buf(),
            message: std::io::Error::from(e).to_string(),
        })
    }

    fn mounts(&self) -> ImmucoreResult<Vec<MountEntry>> {
        let proc_error = |e: procfs::ProcError| ImmucoreError::Io(std::io::Error::other(e.to_string()));
        let infos = procfs::process::Process::myself()
            .map_err(proc_error)?
            .mountinfo()
            .map_err(proc_error)?;

        Ok(infos
            .into_iter()
            .map(|info| MountEntry {
                source: info.mount_source.unwrap_or_default(),
                target: info.mount_point,
                fstype: info.fs_type,
            })
            .collect())
    }

    fn make_shared(&self, target: &Path, recursive: bool) -> ImmucoreResult<()> {
        use rustix::mount::{MountPropagationFlags, mount_change};

        tracing::debug!(target = %target.display(), recursive, "Making mount shared");

        let mut flags = MountPropagationFlags::SHARED;
        if recursive {
            flags |= MountPropagationFlags::REC;
        }
        mount_change(target, flags).map_err(errno)
    }

    fn move_mount(&self, from: &Path, to: &Path) -> ImmucoreResult<()> {
        tracing::debug!(from = %from.display(), to = %to.display(), "Moving mount");

        rustix::mount::mount_move(from, to).map_err(errno)
    }

    fn remount_readonly(&self, target: &Path) -> ImmucoreResult<()> {
        tracing::debug!(target = %target.display(), "Remounting read-only");

        rustix::mount::mount_remount(target, MountFlags::RDONLY, "").map_err(errno)
    }

    fn switch_root(&self, new_root: &Path) -> ImmucoreResult<()> {
        tracing::info!(new_root = %new_root.display(), "Switching root");

        std::env::set_current_dir(new_root)?;
        rustix::mount::mount_move(".", "/").map_err(errno)?;
        std::os::unix::fs::chroot(".")?;
        std::env::set_current_dir("/")?;
        Ok(())
    }

    fn exec(&self, program: &str, args: &[&str]) -> ImmucoreResult<()> {
        use std::os::unix::process::CommandExt;

        tracing::info!(program, "Executing");
        crate::logging::flush();

        let err = std::process::Command::new(program)
            .args(args)
            .env("PATH", child_path())
            .exec();
        Err(ImmucoreError::Pivot {
            message: format!("exec {program}: {err}"),
        })
    }

    async fn run(&self, command: &CommandSpec) -> ImmucoreResult<CommandOutput> {
        tracing::debug!(command = %command, "Running helper");

        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .env("PATH", child_path())
            .envs(command.env.iter().cloned())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ImmucoreError::Command {
                program: command.program.clone(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
