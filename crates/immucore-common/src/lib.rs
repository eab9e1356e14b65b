//! # immucore-common
//!
//! Shared types for the immucore boot orchestrator:
//! - Error taxonomy
//! - Kernel cmdline oracle
//! - fstab entries and path helpers
//! - Standard host paths

#![warn(missing_docs)]

pub mod cmdline;
pub mod error;
pub mod fstab;
pub mod paths;

pub use cmdline::{Cmdline, RootMode};
pub use error::{ImmucoreError, ImmucoreResult};
pub use fstab::FstabEntry;
pub use paths::BootPaths;
