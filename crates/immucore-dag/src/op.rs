//! Operation descriptions added to a [`Graph`](crate::Graph).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use immucore_common::ImmucoreResult;

/// Future returned by an operation callback.
pub type OpFuture = BoxFuture<'static, ImmucoreResult<()>>;

/// Operation body. Called at most once per graph run.
pub type Callback = Arc<dyn Fn() -> OpFuture + Send + Sync>;

/// Enablement predicate, evaluated when the graph is analyzed for a run.
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

/// A named node before it is added to a graph.
///
/// ```
/// use immucore_dag::Op;
///
/// let op = Op::new()
///     .deps(["mount-root"])
///     .weak_deps(["kcrypt-unlock"])
///     .callback(|| async { Ok(()) });
/// assert_eq!(op.strong_deps(), ["mount-root"]);
/// ```
#[derive(Clone, Default)]
pub struct Op {
    pub(crate) deps: Vec<String>,
    pub(crate) weak_deps: Vec<String>,
    pub(crate) condition: Option<Condition>,
    pub(crate) background: bool,
    pub(crate) wait_background: bool,
    pub(crate) callback: Option<Callback>,
}

impl Op {
    /// Operation with no dependencies and no body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strong dependencies: must have succeeded for this op to run.
    #[must_use]
    pub fn deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Weak dependencies: ordering only, outcome and presence are ignored.
    #[must_use]
    pub fn weak_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.weak_deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Only run when `condition` holds at analysis time.
    #[must_use]
    pub fn enable_if<F>(mut self, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Run concurrently with successors instead of blocking them.
    #[must_use]
    pub const fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Wait for every background op started so far before running.
    #[must_use]
    pub const fn wait_background(mut self) -> Self {
        self.wait_background = true;
        self
    }

    /// Body of the operation.
    #[must_use]
    pub fn callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ImmucoreResult<()>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move || callback().boxed()));
        self
    }

    /// Strong dependency names.
    #[must_use]
    pub fn strong_deps(&self) -> &[String] {
        &self.deps
    }

    /// Weak dependency names.
    #[must_use]
    pub fn weak_dependencies(&self) -> &[String] {
        &self.weak_deps
    }

    /// All dependency names, strong first.
    pub fn all_deps(&self) -> impl Iterator<Item = &String> {
        self.deps.iter().chain(self.weak_deps.iter())
    }

    /// Whether this op runs in the background.
    #[must_use]
    pub const fn is_background(&self) -> bool {
        self.background
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("deps", &self.deps)
            .field("weak_deps", &self.weak_deps)
            .field("conditional", &self.condition.is_some())
            .field("background", &self.background)
            .field("wait_background", &self.wait_background)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
