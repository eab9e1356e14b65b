//! # Immucore
//!
//! Immucore composes the root filesystem of an immutable Linux system from
//! the initramfs and hands over to the real init.
//!
//! ## Pipelines
//!
//! - **normal**: mount the state partition, loop-mount the root image, layer
//!   writable overlays and persistent binds on top, write `/etc/fstab`
//! - **live**: wait for a root provided by live media or netboot and run the
//!   stage hooks
//! - **uki**: build everything inside a unified kernel image initramfs, then
//!   rebuild that root in a tmpfs and switch to it
//!
//! Each pipeline is a table of steps registered in an
//! [`immucore_dag::Graph`]; [`pipeline::register`] picks the table from the
//! kernel cmdline.

#![warn(missing_docs)]

pub mod cli;
pub mod context;
pub mod filesystem;
pub mod host;
pub mod layout;
pub mod logging;
pub mod pipeline;
pub mod sentinel;
pub mod state;
pub mod steps;
pub mod system;

pub use context::{BootContext, BootMode};
pub use state::BootState;
