//! Pipeline wirings: which steps run for a boot mode and how they depend on
//! each other.
//!
//! A wiring is a static table of [`Wiring`] rows. [`register`] turns every row
//! into a graph operation through [`steps::op`] and adds it to the graph,
//! applying the row's [`Policy`] when the graph rejects it.

pub mod live;
pub mod normal;
pub mod uki;

use std::sync::Arc;

use immucore_common::ImmucoreResult;
use immucore_dag::Graph;

use crate::context::{BootContext, BootMode};
use crate::steps::{self, StepName};

/// What a failure to register a step means for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Log the error and keep registering.
    Log,
    /// Log the error and abort registration.
    Return,
    /// The pipeline cannot boot without this step.
    Panic,
}

/// One step of a pipeline and its edges.
#[derive(Debug, Clone, Copy)]
pub struct Wiring {
    /// Step to run.
    pub step: StepName,
    /// Steps that must have succeeded.
    pub deps: &'static [StepName],
    /// Steps that only order this one.
    pub weak: &'static [StepName],
    /// Registration failure handling.
    pub policy: Policy,
    /// Run concurrently with successors.
    pub background: bool,
    /// Join every background step first.
    pub wait_background: bool,
}

impl Wiring {
    /// Row with no edges and the [`Policy::Log`] policy.
    #[must_use]
    pub const fn step(step: StepName) -> Self {
        Self {
            step,
            deps: &[],
            weak: &[],
            policy: Policy::Log,
            background: false,
            wait_background: false,
        }
    }

    /// Strong dependencies.
    #[must_use]
    pub const fn after(mut self, deps: &'static [StepName]) -> Self {
        self.deps = deps;
        self
    }

    /// Weak dependencies.
    #[must_use]
    pub const fn after_weak(mut self, weak: &'static [StepName]) -> Self {
        self.weak = weak;
        self
    }

    /// Registration policy.
    #[must_use]
    pub const fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Run in the background.
    #[must_use]
    pub const fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Wait for background steps first.
    #[must_use]
    pub const fn wait_background(mut self) -> Self {
        self.wait_background = true;
        self
    }
}

/// Wiring for a boot mode.
#[must_use]
pub const fn wiring(mode: BootMode) -> &'static [Wiring] {
    match mode {
        BootMode::Normal => normal::WIRING,
        BootMode::Live => live::WIRING,
        BootMode::Uki => uki::WIRING,
    }
}

/// Register the pipeline selected by the context's boot mode.
pub fn register(graph: &mut Graph, ctx: &Arc<BootContext>) -> ImmucoreResult<()> {
    tracing::info!(mode = %ctx.mode, "Registering pipeline");
    register_wiring(graph, ctx, wiring(ctx.mode))
}

/// Add every row of `table` to `graph`.
///
/// # Panics
///
/// When a row with [`Policy::Panic`] cannot be added.
pub fn register_wiring(
    graph: &mut Graph,
    ctx: &Arc<BootContext>,
    table: &[Wiring],
) -> ImmucoreResult<()> {
    for row in table {
        let mut op = steps::op(ctx, row.step)
            .deps(row.deps.iter().map(|s| s.as_str()))
            .weak_deps(row.weak.iter().map(|s| s.as_str()));
        if row.background {
            op = op.background();
        }
        if row.wait_background {
            op = op.wait_background();
        }

        if let Err(e) = graph.add(row.step.as_str(), op) {
            tracing::error!(step = %row.step, error = %e, "Could not register step");
            match row.policy {
                Policy::Log => {}
                Policy::Return => return Err(e),
                Policy::Panic => panic!("cannot boot without {}: {e}", row.step),
            }
        }
    }
    Ok(())
}
