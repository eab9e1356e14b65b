//! Graph construction, analysis and rendering.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use immucore_common::{ImmucoreError, ImmucoreResult};
use parking_lot::Mutex;

use crate::op::Op;

/// Execution status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not reached yet.
    Pending,
    /// Callback in flight.
    Running,
    /// Callback returned `Ok`.
    Succeeded,
    /// Callback returned an error.
    Failed,
    /// Not run because a strong dependency did not succeed.
    Skipped,
    /// Not run because its condition was false.
    Disabled,
}

impl NodeStatus {
    /// Whether strong dependents may run after this node.
    #[must_use]
    pub const fn satisfies(self) -> bool {
        matches!(self, Self::Succeeded | Self::Disabled)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) status: NodeStatus,
    pub(crate) executed: bool,
    pub(crate) error: Option<Arc<ImmucoreError>>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            executed: false,
            error: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) op: Op,
    pub(crate) state: Arc<Mutex<NodeState>>,
}

/// Snapshot of a node for inspection.
#[derive(Debug, Clone)]
pub struct NodeReport {
    /// Node name.
    pub name: String,
    /// Strong dependencies.
    pub deps: Vec<String>,
    /// Weak dependencies.
    pub weak_deps: Vec<String>,
    /// Background flag.
    pub background: bool,
    /// Current status.
    pub status: NodeStatus,
    /// Whether the callback was invoked.
    pub executed: bool,
    /// Error captured from the callback, or the reason it was skipped.
    pub error: Option<Arc<ImmucoreError>>,
}

pub(crate) type BackgroundDone = Shared<BoxFuture<'static, ()>>;

/// Directed acyclic graph of named operations.
#[derive(Default)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) background: Mutex<HashMap<String, BackgroundDone>>,
}

impl Graph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named operation.
    ///
    /// Dependencies may name operations that are added later. Adding a name
    /// twice, or an edge that closes a cycle, is rejected.
    pub fn add(&mut self, name: impl Into<String>, op: Op) -> ImmucoreResult<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ImmucoreError::DuplicateStep { name });
        }

        for dep in op.all_deps() {
            if *dep == name || self.reaches(dep, &name) {
                return Err(ImmucoreError::DependencyCycle {
                    name,
                    dependency: dep.clone(),
                });
            }
        }

        tracing::trace!(step = %name, ?op, "Adding operation");
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(Node {
            name,
            op,
            state: Arc::default(),
        });
        Ok(())
    }

    /// Whether a node with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Node names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Depth-first search along dependency edges of existing nodes.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.node(current) {
                stack.extend(node.op.all_deps().map(String::as_str));
            }
        }
        false
    }

    /// Topological layers. Every node sits one layer below its deepest
    /// present dependency (strong or weak); names within a layer are sorted.
    #[must_use]
    pub fn analyze(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        for node in &self.nodes {
            self.depth_of(&node.name, &mut depth);
        }

        let layers = depth.values().copied().max().map_or(0, |max| max + 1);
        let mut out = vec![Vec::new(); layers];
        for node in &self.nodes {
            out[depth[node.name.as_str()]].push(node.name.clone());
        }
        for layer in &mut out {
            layer.sort();
        }
        out
    }

    fn depth_of<'a>(&'a self, name: &'a str, memo: &mut HashMap<&'a str, usize>) -> usize {
        if let Some(&d) = memo.get(name) {
            return d;
        }
        let depth = self.node(name).map_or(0, |node| {
            node.op
                .all_deps()
                .filter(|dep| self.contains(dep))
                .map(|dep| self.depth_of(dep, memo) + 1)
                .max()
                .unwrap_or(0)
        });
        memo.insert(name, depth);
        depth
    }

    /// Snapshot of one node.
    #[must_use]
    pub fn report(&self, name: &str) -> Option<NodeReport> {
        self.node(name).map(|node| {
            let state = node.state.lock();
            NodeReport {
                name: node.name.clone(),
                deps: node.op.deps.clone(),
                weak_deps: node.op.weak_deps.clone(),
                background: node.op.background,
                status: state.status,
                executed: state.executed,
                error: state.error.clone(),
            }
        })
    }

    /// Snapshots of all nodes in insertion order.
    #[must_use]
    pub fn reports(&self) -> Vec<NodeReport> {
        self.nodes
            .iter()
            .filter_map(|node| self.report(&node.name))
            .collect()
    }

    /// Layered listing of the graph with per-node execution status.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, layer) in self.analyze().iter().enumerate() {
            out.push_str(&format!("{}.\n", i + 1));
            for name in layer {
                let Some(report) = self.report(name) else {
                    continue;
                };
                let error = report
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                out.push_str(&format!(
                    " <{}> (background: {}) (run: {}) (status: {}) (error: {})\n",
                    report.name, report.background, report.executed, report.status, error
                ));
            }
        }
        out
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.names())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
