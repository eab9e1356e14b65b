//! Common error types for immucore.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ImmucoreError`].
pub type ImmucoreResult<T> = Result<T, ImmucoreError>;

/// Errors raised while composing the root filesystem.
#[derive(Error, Diagnostic, Debug)]
pub enum ImmucoreError {
    /// The target of a mount already carries a mount.
    #[error("{target} is already mounted")]
    #[diagnostic(code(immucore::mount::already_mounted))]
    AlreadyMounted {
        /// Mount target.
        target: PathBuf,
    },

    /// A single mount attempt failed.
    #[error("Failed to mount {source_spec} on {target}: {message}")]
    #[diagnostic(code(immucore::mount::failed))]
    MountFailed {
        /// Mount source.
        source_spec: String,
        /// Mount target.
        target: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// The retry loop of a mount ran out of time.
    #[error("Mount of {source_spec} on {target} exhausted its {timeout:?} timeout: {last_error}")]
    #[diagnostic(
        code(immucore::mount::exhausted),
        help("The device may not exist yet; check udev and the kernel cmdline labels")
    )]
    MountExhausted {
        /// Mount source.
        source_spec: String,
        /// Mount target.
        target: PathBuf,
        /// Budget that ran out.
        timeout: Duration,
        /// Last error observed before giving up.
        last_error: String,
    },

    /// The boot context was cancelled while an operation was waiting.
    #[error("Operation cancelled: {operation}")]
    #[diagnostic(code(immucore::cancelled))]
    ContextCanceled {
        /// What was interrupted.
        operation: String,
    },

    /// A polled condition never became true.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    #[diagnostic(code(immucore::timeout))]
    Timeout {
        /// What was awaited.
        what: String,
        /// Budget that ran out.
        timeout: Duration,
    },

    /// Invalid configuration value (cmdline, layout file, overlay spec).
    #[error("Bad configuration: {message}")]
    #[diagnostic(code(immucore::config))]
    BadConfig {
        /// The error message.
        message: String,
    },

    /// Normal boot without a `cos-img/filename` cmdline flag.
    #[error("No target image given on the kernel cmdline")]
    #[diagnostic(
        code(immucore::config::missing_target_image),
        help("Pass cos-img/filename=/cOS/active.img or boot with rd.immucore.disable")
    )]
    MissingTargetImage,

    /// UKI boot with secure boot turned off and no override.
    #[error("Secure boot is disabled")]
    #[diagnostic(
        code(immucore::uki::secure_boot),
        help("Enable secure boot in the firmware or add rd.immucore.securebootdisabled")
    )]
    SecureBootDisabled,

    /// An external helper exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    #[diagnostic(code(immucore::command))]
    Command {
        /// Program that was run.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// An operation with the same name is already part of the graph.
    #[error("Step {name} is already registered")]
    #[diagnostic(code(immucore::dag::duplicate))]
    DuplicateStep {
        /// Step name.
        name: String,
    },

    /// Adding an operation would close a dependency cycle.
    #[error("Step {name} depending on {dependency} creates a cycle")]
    #[diagnostic(code(immucore::dag::cycle))]
    DependencyCycle {
        /// Step being added.
        name: String,
        /// Dependency that leads back to it.
        dependency: String,
    },

    /// A strong dependency did not succeed.
    #[error("Step {name} skipped: dependency {dependency} did not succeed")]
    #[diagnostic(code(immucore::dag::dependency_failed))]
    DependencyFailed {
        /// Step that was skipped.
        name: String,
        /// Dependency that failed, was skipped or is missing.
        dependency: String,
    },

    /// Several independent failures of one step.
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    #[diagnostic(code(immucore::multiple))]
    Multiple(Vec<ImmucoreError>),

    /// The final root switch failed.
    #[error("Pivot failed: {message}")]
    #[diagnostic(code(immucore::pivot))]
    Pivot {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(immucore::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(immucore::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(immucore::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl ImmucoreError {
    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::BadConfig {
            message: message.into(),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself, more become `Multiple`.
    pub fn collect(mut errors: Vec<Self>) -> ImmucoreResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Whether this error only reports an existing mount.
    #[must_use]
    pub const fn is_already_mounted(&self) -> bool {
        matches!(self, Self::AlreadyMounted { .. })
    }
}

fn join_errors(errors: &[ImmucoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for ImmucoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
