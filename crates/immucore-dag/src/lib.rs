//! # immucore-dag
//!
//! A small dependency graph of named asynchronous operations.
//!
//! Operations declare strong dependencies (must have succeeded) and weak
//! dependencies (ordering only). [`Graph::analyze`] groups them into
//! topological layers, [`Graph::run`] executes the layers in order with every
//! node of a layer running concurrently, and [`Graph::render`] prints the
//! layers together with the outcome of each node.

#![warn(missing_docs)]

mod graph;
mod op;
mod run;

pub use graph::{Graph, NodeReport, NodeStatus};
pub use op::{Callback, Condition, Op, OpFuture};
