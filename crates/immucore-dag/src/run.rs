//! Layered execution of a [`Graph`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use immucore_common::{ImmucoreError, ImmucoreResult};
use parking_lot::Mutex;

use crate::graph::{BackgroundDone, Graph, Node, NodeState, NodeStatus};

impl Graph {
    /// Execute every node, layer by layer.
    ///
    /// Nodes of one layer run concurrently. A failing node never stops the
    /// run: its strong dependents are skipped, weak dependents still run.
    /// Returns once every node, background ones included, has terminated.
    pub async fn run(&self) {
        for node in &self.nodes {
            let mut state = node.state.lock();
            *state = NodeState::default();
            if let Some(condition) = &node.op.condition {
                if !condition() {
                    tracing::debug!(step = %node.name, "Condition false, disabling");
                    state.status = NodeStatus::Disabled;
                }
            }
        }
        self.background.lock().clear();

        for (depth, layer) in self.analyze().into_iter().enumerate() {
            tracing::debug!(layer = depth + 1, steps = ?layer, "Running layer");
            let nodes = layer.iter().filter_map(|name| self.node(name));
            join_all(nodes.map(|node| self.execute(node))).await;
        }

        self.join_background().await;
    }

    /// Names of the nodes whose callback failed in the last run.
    #[must_use]
    pub fn failed(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.state.lock().status == NodeStatus::Failed)
            .map(|node| node.name.clone())
            .collect()
    }

    /// Wait for every background node started so far.
    pub async fn join_background(&self) {
        let pending: Vec<BackgroundDone> = self.background.lock().values().cloned().collect();
        join_all(pending).await;
    }

    async fn wait_for(&self, name: &str) {
        let pending = self.background.lock().get(name).cloned();
        if let Some(done) = pending {
            done.await;
        }
    }

    async fn execute(&self, node: &Node) {
        if node.state.lock().status == NodeStatus::Disabled {
            return;
        }

        for dep in node.op.all_deps() {
            self.wait_for(dep).await;
        }
        if node.op.wait_background {
            self.join_background().await;
        }

        if let Some(dependency) = self.unsatisfied_dependency(node) {
            tracing::warn!(step = %node.name, %dependency, "Skipping step");
            let mut state = node.state.lock();
            state.status = NodeStatus::Skipped;
            state.error = Some(Arc::new(ImmucoreError::DependencyFailed {
                name: node.name.clone(),
                dependency,
            }));
            return;
        }

        {
            let mut state = node.state.lock();
            state.status = NodeStatus::Running;
            state.executed = true;
        }

        let Some(callback) = node.op.callback.clone() else {
            finish(&node.name, &node.state, Ok(()));
            return;
        };

        if node.op.background {
            tracing::debug!(step = %node.name, "Starting in background");
            let name = node.name.clone();
            let state = Arc::clone(&node.state);
            let handle = tokio::spawn({
                let name = name.clone();
                let state = Arc::clone(&state);
                async move {
                    let result = callback().await;
                    finish(&name, &state, result);
                }
            });
            let done = async move {
                if let Err(e) = handle.await {
                    finish(
                        &name,
                        &state,
                        Err(ImmucoreError::Internal {
                            message: format!("background step aborted: {e}"),
                        }),
                    );
                }
            }
            .boxed()
            .shared();
            self.background.lock().insert(node.name.clone(), done);
            return;
        }

        tracing::debug!(step = %node.name, "Running step");
        let result = AssertUnwindSafe(callback())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ImmucoreError::Internal {
                    message: "step panicked".to_string(),
                })
            });
        finish(&node.name, &node.state, result);
    }

    /// First strong dependency that is missing or did not succeed.
    fn unsatisfied_dependency(&self, node: &Node) -> Option<String> {
        node.op
            .deps
            .iter()
            .find(|dep| {
                self.node(dep)
                    .is_none_or(|dep| !dep.state.lock().status.satisfies())
            })
            .cloned()
    }
}

fn finish(name: &str, state: &Mutex<NodeState>, result: ImmucoreResult<()>) {
    let mut state = state.lock();
    match result {
        Ok(()) => {
            tracing::debug!(step = %name, "Step succeeded");
            state.status = NodeStatus::Succeeded;
        }
        Err(e) => {
            tracing::error!(step = %name, error = %e, "Step failed");
            state.status = NodeStatus::Failed;
            state.error = Some(Arc::new(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::Op;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Op {
        let log = Arc::clone(log);
        Op::new().callback(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(name.to_string());
                Ok(())
            }
        })
    }

    fn failing() -> Op {
        Op::new().callback(|| async { Err(ImmucoreError::config("broken")) })
    }

    #[test_log::test(tokio::test)]
    async fn strong_failure_skips_dependents_weak_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut g = Graph::new();
        g.add("broken", failing()).unwrap();
        g.add("strong", recorder(&log, "strong").deps(["broken"])).unwrap();
        g.add("weak", recorder(&log, "weak").weak_deps(["broken"])).unwrap();
        g.add("chained", recorder(&log, "chained").deps(["strong"])).unwrap();

        g.run().await;

        assert_eq!(*log.lock(), vec!["weak".to_string()]);
        assert_eq!(g.report("broken").unwrap().status, NodeStatus::Failed);
        assert_eq!(g.report("strong").unwrap().status, NodeStatus::Skipped);
        assert_eq!(g.report("chained").unwrap().status, NodeStatus::Skipped);
        assert!(!g.report("strong").unwrap().executed);
        assert_eq!(g.report("weak").unwrap().status, NodeStatus::Succeeded);
        assert_eq!(g.failed(), vec!["broken".to_string()]);
    }

    #[tokio::test]
    async fn missing_strong_dependency_skips_missing_weak_does_not() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut g = Graph::new();
        g.add("needs-ghost", recorder(&log, "needs").deps(["ghost"])).unwrap();
        g.add("likes-ghost", recorder(&log, "likes").weak_deps(["ghost"])).unwrap();

        g.run().await;

        assert_eq!(*log.lock(), vec!["likes".to_string()]);
        let report = g.report("needs-ghost").unwrap();
        assert!(matches!(
            report.error.as_deref(),
            Some(ImmucoreError::DependencyFailed { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[tokio::test]
    async fn disabled_nodes_count_as_satisfied() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut g = Graph::new();
        g.add("off", recorder(&log, "off").enable_if(|| false)).unwrap();
        g.add("after", recorder(&log, "after").deps(["off"])).unwrap();

        g.run().await;

        assert_eq!(*log.lock(), vec!["after".to_string()]);
        assert_eq!(g.report("off").unwrap().status, NodeStatus::Disabled);
    }

    #[tokio::test]
    async fn layers_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut g = Graph::new();
        g.add("c", recorder(&log, "c").deps(["b"])).unwrap();
        g.add("b", recorder(&log, "b").weak_deps(["a"])).unwrap();
        g.add("a", recorder(&log, "a")).unwrap();

        g.run().await;

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn barrier_waits_for_background() {
        let finished = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicBool::new(false));
        let mut g = Graph::new();

        let flag = Arc::clone(&finished);
        g.add(
            "slow",
            Op::new().background().callback(move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();
        g.add("unrelated", Op::new()).unwrap();

        let (flag, out) = (Arc::clone(&finished), Arc::clone(&seen));
        g.add(
            "barrier",
            Op::new()
                .weak_deps(["unrelated"])
                .wait_background()
                .callback(move || {
                    let (flag, out) = (Arc::clone(&flag), Arc::clone(&out));
                    async move {
                        out.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
                        Ok(())
                    }
                }),
        )
        .unwrap();

        g.run().await;

        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(g.report("slow").unwrap().status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn background_failure_skips_strong_dependent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut g = Graph::new();
        g.add(
            "bg",
            Op::new()
                .background()
                .callback(|| async { Err(ImmucoreError::config("nope")) }),
        )
        .unwrap();
        let counter = Arc::clone(&calls);
        g.add(
            "dependent",
            Op::new().deps(["bg"]).callback(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        g.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(g.report("bg").unwrap().status, NodeStatus::Failed);
        assert_eq!(g.report("dependent").unwrap().status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn panicking_step_is_recorded() {
        let mut g = Graph::new();
        g.add(
            "boom",
            Op::new().callback(|| async {
                panic!("boom");
            }),
        )
        .unwrap();
        g.add("next", Op::new().weak_deps(["boom"])).unwrap();

        g.run().await;

        assert_eq!(g.report("boom").unwrap().status, NodeStatus::Failed);
        assert_eq!(g.report("next").unwrap().status, NodeStatus::Succeeded);
        assert!(g.render().contains("step panicked"));
    }
}
