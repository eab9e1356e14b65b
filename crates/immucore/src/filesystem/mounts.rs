//! Mount operations and the retrying mount primitive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use immucore_common::{FstabEntry, ImmucoreError, ImmucoreResult};
use tokio::time::Instant;

use crate::context::BootContext;
use crate::filesystem::copy::copy_tree;
use crate::host::{CommandSpec, MountRequest};

/// Filesystems that are never backed by a block device.
const VIRTUAL_FILESYSTEMS: &[&str] = &[
    "tmpfs", "overlay", "none", "proc", "sysfs", "devtmpfs", "devpts", "securityfs", "debugfs",
    "efivarfs",
];

/// How a [`MountOperation`] reaches the kernel, and what it prepares first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// A regular mount.
    Plain,
    /// overlayfs; upper and work directories are created beforehand.
    Overlay {
        /// Writable layer.
        upper: PathBuf,
        /// overlayfs scratch directory.
        work: PathBuf,
    },
    /// Bind of a per-path state directory, seeded from the target on first use.
    Bind {
        /// Backing directory.
        state_path: PathBuf,
    },
}

/// A single mount together with the fstab line it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOperation {
    /// Device, image or pseudo source.
    pub source: String,
    /// Mountpoint.
    pub target: PathBuf,
    /// Requested filesystem type.
    pub fstype: String,
    /// Mount options.
    pub options: Vec<String>,
    /// Line recorded once the mount exists.
    pub fstab: FstabEntry,
    /// Variant specific behavior.
    pub kind: MountKind,
    /// Retry budget.
    pub timeout: Duration,
}

impl MountOperation {
    /// Plain mount. Path sources keep their (normalized) path as fstab spec;
    /// pseudo sources are named after the filesystem and target.
    pub fn new(
        ctx: &BootContext,
        source: impl Into<String>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        let fstype = fstype.into();
        let spec = if source.starts_with('/') {
            source.clone()
        } else {
            ctx.virtual_source(&fstype, &target)
        };
        let fstab = ctx.fstab_entry(&spec, &target, &fstype, &options);

        Self {
            source,
            target,
            fstype,
            options,
            fstab,
            kind: MountKind::Plain,
            timeout: ctx.mount_timeout,
        }
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the filesystem type should be re-probed before each attempt.
    fn probes(&self) -> bool {
        self.kind == MountKind::Plain
            && self.source.starts_with('/')
            && !VIRTUAL_FILESYSTEMS.contains(&self.fstype.as_str())
    }

    /// Create directories and seed state before the mount.
    pub fn prepare(&self) -> ImmucoreResult<()> {
        match &self.kind {
            MountKind::Plain => {}
            MountKind::Overlay { upper, work } => {
                std::fs::create_dir_all(upper)?;
                std::fs::create_dir_all(work)?;
            }
            MountKind::Bind { state_path } => {
                if !state_path.exists() {
                    std::fs::create_dir_all(state_path)?;
                    if self.target.is_dir() {
                        tracing::debug!(
                            from = %self.target.display(),
                            to = %state_path.display(),
                            "Seeding bind state"
                        );
                        copy_tree(&self.target, state_path)?;
                    }
                }
            }
        }
        std::fs::create_dir_all(&self.target)?;
        Ok(())
    }

    fn request(&self, fstype: &str) -> MountRequest {
        MountRequest {
            source: self.source.clone(),
            target: self.target.clone(),
            fstype: fstype.to_string(),
            options: self.options.clone(),
        }
    }
}

/// Perform `op`, retrying until it succeeds, its timeout runs out or the
/// context is cancelled. An existing mount on the target counts as success.
/// Either way the fstab entry is recorded on the boot state.
pub async fn mount_with_fstab(ctx: &BootContext, op: &MountOperation) -> ImmucoreResult<()> {
    let deadline = Instant::now() + op.timeout;
    let mut fstype = op.fstype.clone();
    let mut last_error = String::from("no attempt made");

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(canceled(op));
        }
        if Instant::now() >= deadline {
            return Err(ImmucoreError::MountExhausted {
                source_spec: op.source.clone(),
                target: op.target.clone(),
                timeout: op.timeout,
                last_error,
            });
        }

        match attempt(ctx, op, &mut fstype, deadline).await {
            Ok(()) => {
                tracing::info!(source = %op.source, target = %op.target.display(), "Mounted");
                record(ctx, op, &fstype);
                return Ok(());
            }
            Err(e) if e.is_already_mounted() => {
                tracing::debug!(target = %op.target.display(), "Already mounted");
                record(ctx, op, &fstype);
                return Ok(());
            }
            Err(e @ ImmucoreError::ContextCanceled { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!(target = %op.target.display(), error = %e, "Mount attempt failed");
                last_error = e.to_string();
            }
        }
    }
}

async fn attempt(
    ctx: &BootContext,
    op: &MountOperation,
    fstype: &mut String,
    deadline: Instant,
) -> ImmucoreResult<()> {
    if ctx.host.is_mounted(&op.target) {
        return Err(ImmucoreError::AlreadyMounted {
            target: op.target.clone(),
        });
    }

    if op.probes() {
        if let Some(probed) = probe_fs_type(ctx, &op.source).await {
            if probed != *fstype {
                tracing::debug!(source = %op.source, from = %fstype, to = %probed, "Adopting probed filesystem type");
                *fstype = probed;
            }
        }
    }

    // A failed prepare still waits out the settle delay before the retry.
    let prepared = op.prepare();
    settle(ctx, op, deadline).await?;
    prepared?;

    if op.probes() {
        let fsck = CommandSpec::new("fsck").args(["-a", op.source.as_str()]);
        if let Err(e) = ctx.host.run(&fsck).await {
            tracing::debug!(source = %op.source, error = %e, "fsck failed, ignoring");
        }
    }

    match &op.kind {
        MountKind::Bind { state_path } => ctx.host.bind(state_path, &op.target, false),
        MountKind::Plain | MountKind::Overlay { .. } => ctx.host.mount(&op.request(fstype)),
    }
}

async fn settle(ctx: &BootContext, op: &MountOperation, deadline: Instant) -> ImmucoreResult<()> {
    let pause = Instant::now() + ctx.settle_delay;
    tokio::select! {
        () = ctx.cancel.cancelled() => Err(canceled(op)),
        () = tokio::time::sleep_until(pause.min(deadline)) => Ok(()),
    }
}

fn record(ctx: &BootContext, op: &MountOperation, fstype: &str) {
    let mut entry = op.fstab.clone();
    if entry.vfstype == op.fstype {
        entry.vfstype = fstype.to_string();
    }
    ctx.state.record_fstab(entry);
}

fn canceled(op: &MountOperation) -> ImmucoreError {
    ImmucoreError::ContextCanceled {
        operation: format!("mount of {} on {}", op.source, op.target.display()),
    }
}

/// Filesystem type of a block device, if it can be determined.
pub async fn probe_fs_type(ctx: &BootContext, device: &str) -> Option<String> {
    let blkid = CommandSpec::new("blkid").args(["-s", "TYPE", "-o", "value", device]);
    let output = ctx.host.run(&blkid).await.ok()?;
    let fstype = output.stdout.trim();
    (output.success() && !fstype.is_empty()).then(|| fstype.to_string())
}

/// Mount `source` at `target` with the default budget.
pub async fn mount(
    ctx: &BootContext,
    source: &str,
    target: &Path,
    fstype: &str,
    options: &[&str],
) -> ImmucoreResult<()> {
    let op = MountOperation::new(
        ctx,
        source,
        target,
        fstype,
        options.iter().map(ToString::to_string).collect(),
    );
    mount_with_fstab(ctx, &op).await
}
