//! Side effects on the running system.
//!
//! Every mount, mount-table query and external helper invocation made by
//! the boot steps goes through [`Host`]. [`LinuxHost`] talks to the kernel;
//! tests substitute a recording implementation.

mod linux;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use immucore_common::{ImmucoreError, ImmucoreResult};

pub use linux::{LinuxHost, split_options};

/// One mount request as handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device, image or pseudo source.
    pub source: String,
    /// Mountpoint.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Options, flags and filesystem data mixed as in fstab.
    pub options: Vec<String>,
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source.
    pub source: String,
    /// Mountpoint.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
}

/// External program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the program exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Kernel and process facilities used by the boot steps.
#[async_trait]
pub trait Host: Send + Sync + fmt::Debug {
    /// Mount a filesystem. Returns [`ImmucoreError::AlreadyMounted`] when the
    /// target is busy.
    fn mount(&self, request: &MountRequest) -> ImmucoreResult<()>;

    /// Bind `source` onto `target`.
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> ImmucoreResult<()>;

    /// Current mount table.
    fn mounts(&self) -> ImmucoreResult<Vec<MountEntry>>;

    /// Mark a mount shared, optionally for the whole subtree.
    fn make_shared(&self, target: &Path, recursive: bool) -> ImmucoreResult<()>;

    /// Move a mount to a new location.
    fn move_mount(&self, from: &Path, to: &Path) -> ImmucoreResult<()>;

    /// Remount an existing mount read-only.
    fn remount_readonly(&self, target: &Path) -> ImmucoreResult<()>;

    /// Make `new_root` the root of this process: move it onto `/` and
    /// chroot into it.
    fn switch_root(&self, new_root: &Path) -> ImmucoreResult<()>;

    /// Replace the process image with `program`.
    ///
    /// Returns an error on failure; hosts that do not replace the process
    /// return `Ok`.
    fn exec(&self, program: &str, args: &[&str]) -> ImmucoreResult<()>;

    /// Run a program to completion and capture its output.
    async fn run(&self, command: &CommandSpec) -> ImmucoreResult<CommandOutput>;

    /// Whether `target` is a mountpoint.
    fn is_mounted(&self, target: &Path) -> bool {
        self.mounts()
            .map(|mounts| mounts.iter().any(|m| m.target == target))
            .unwrap_or(false)
    }

    /// Run a program and fail unless it exits successfully.
    async fn run_checked(&self, command: &CommandSpec) -> ImmucoreResult<CommandOutput> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ImmucoreError::Command {
                program: command.program.clone(),
                status: output
                    .code
                    .map_or_else(|| "killed".to_string(), |code| format!("exit {code}")),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}
