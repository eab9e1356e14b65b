//! CLI command definitions and handlers.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use immucore_common::{BootPaths, Cmdline, ImmucoreError};
use immucore_dag::Graph;

use crate::context::{BootContext, BootMode};
use crate::filesystem::pivot;
use crate::host::LinuxHost;
use crate::{logging, pipeline};

/// Immucore - early-userspace boot orchestrator
#[derive(Parser)]
#[command(name = "immucore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Immucore commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Compose the root filesystem for the kernel cmdline and boot it
    Start {
        /// Register and print the boot graph without running it
        #[arg(long, env = "IMMUCORE_DRY_RUN")]
        dry_run: bool,
    },

    /// Print the version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Start { dry_run } => start(self.debug, dry_run).await,
            Commands::Version => {
                println!("immucore {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

async fn start(debug: bool, dry_run: bool) -> Result<()> {
    let cmdline = Cmdline::new();
    let paths = BootPaths::new();
    let _guard = logging::init(&paths.log_file(), debug || cmdline.debug());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cmdline = %cmdline.read().trim(),
        "Starting immucore"
    );

    let ctx = Arc::new(BootContext::new(cmdline, paths, Arc::new(LinuxHost::new()))?);
    let mut graph = Graph::new();
    pipeline::register(&mut graph, &ctx)?;
    tracing::info!("Boot graph:\n{}", graph.render());

    if dry_run {
        tracing::info!("Dry run, not executing");
        return Ok(());
    }

    graph.run().await;
    tracing::info!("Boot graph after execution:\n{}", graph.render());

    if ctx.mode == BootMode::Uki {
        // uki-init replaces the process on success.
        let cause = ImmucoreError::Pivot {
            message: format!("boot finished without switching root, failed steps: {:?}", graph.failed()),
        };
        if let Err(e) = pivot::emergency_shell(&ctx, cause) {
            panic!("{e}");
        }
    }
    Ok(())
}
