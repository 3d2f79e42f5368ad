//! Test helpers: function-backed queries and a canned environment.
//!
//! Real deployments compile query text elsewhere; tests register
//! [`FnQuery`] instances with a [`TestCompiler`] so runtimes and
//! commands can be exercised without a language front-end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;

use common_error::StrataResult;
use strata_core::{BaseModel, Identity, Node, Value};
use strata_storage::{MemLayer, StoredNode, View};

use crate::core::{Core, Query, QueryCompiler};
use crate::runtime::Runtime;
use crate::snap::{Snap, SnapEvent};
use crate::stream::NodePathStream;

type RunFn = dyn Fn(Arc<Runtime>, NodePathStream) -> BoxFuture<'static, StrataResult<NodePathStream>>
    + Send
    + Sync;

/// A query whose pipeline is a plain function.
pub struct FnQuery {
    text: String,
    classes: Vec<(String, bool)>,
    func: Arc<RunFn>,
}

impl FnQuery {
    /// Create a query from a function over (runtime, input stream).
    pub fn new<F, Fut>(text: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arc<Runtime>, NodePathStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StrataResult<NodePathStream>> + Send + 'static,
    {
        Self {
            text: text.into(),
            classes: Vec::new(),
            func: Arc::new(move |runt, input| Box::pin(func(runt, input))),
        }
    }

    /// A query that forwards its input unchanged.
    pub fn passthrough(text: impl Into<String>) -> Self {
        Self::new(text, |_runt, input| async move { Ok(input) })
    }

    /// Attach compiler-style runtime-safety classifications.
    pub fn with_classes(mut self, classes: &[(&str, bool)]) -> Self {
        self.classes = classes
            .iter()
            .map(|(name, runtsafe)| (name.to_string(), *runtsafe))
            .collect();
        self
    }
}

#[async_trait]
impl Query for FnQuery {
    fn text(&self) -> &str {
        &self.text
    }

    fn runt_vars(&self, _runt: &Runtime) -> Vec<(String, bool)> {
        self.classes.clone()
    }

    async fn run(
        &self,
        runt: Arc<Runtime>,
        input: NodePathStream,
    ) -> StrataResult<NodePathStream> {
        (self.func)(runt, input).await
    }
}

/// Compiler that serves registered queries by exact text, falling back
/// to a passthrough query for unknown text.
#[derive(Default)]
pub struct TestCompiler {
    queries: Mutex<HashMap<String, Arc<dyn Query>>>,
}

impl TestCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a query, keyed by its text.
    pub fn register(&self, query: impl Query + 'static) {
        let query: Arc<dyn Query> = Arc::new(query);
        self.queries
            .lock()
            .unwrap()
            .insert(query.text().to_string(), query);
    }
}

impl QueryCompiler for TestCompiler {
    fn compile(&self, text: &str) -> StrataResult<Arc<dyn Query>> {
        if let Some(query) = self.queries.lock().unwrap().get(text) {
            return Ok(query.clone());
        }
        Ok(Arc::new(FnQuery::passthrough(text)))
    }
}

// ============================================================================
// Canned environment
// ============================================================================

/// A core with one base view and a root user.
pub struct TestEnv {
    pub core: Arc<Core>,
    pub compiler: Arc<TestCompiler>,
    pub root: Arc<Identity>,
    pub base_layer: Arc<MemLayer>,
    pub base_view: Arc<View>,
}

impl TestEnv {
    /// Build the environment: `view00` over `layr00`, user `root`.
    pub fn new() -> Self {
        let compiler = TestCompiler::new();
        let core = Core::new(compiler.clone(), Arc::new(BaseModel));

        let root = core.add_user(Identity::root("root"));

        let base_layer = Arc::new(MemLayer::new("layr00"));
        let base_view = core.add_view(View::new(
            "view00",
            vec![base_layer.clone() as Arc<dyn strata_storage::Layer>],
        ));

        Self {
            core,
            compiler,
            root,
            base_layer,
            base_view,
        }
    }

    /// Fork the base view: `view01` stacking `layr01` over `layr00`.
    pub fn add_fork(&self) -> (Arc<View>, Arc<MemLayer>) {
        let top = Arc::new(MemLayer::new("layr01"));
        let fork = self.core.add_view(View::fork(
            "view01",
            &self.base_view,
            top.clone() as Arc<dyn strata_storage::Layer>,
        ));
        (fork, top)
    }

    /// Open a snap on the base view as root.
    pub fn snap(&self) -> Arc<Snap> {
        self.core.snap(self.root.clone(), self.base_view.clone())
    }

    /// Open a snap on an arbitrary view for an arbitrary user.
    pub fn snap_as(&self, user: Arc<Identity>, view: Arc<View>) -> Arc<Snap> {
        self.core.snap(user, view)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed a stored node with a primary value into a layer.
pub fn seed_node(layr: &MemLayer, iden: u64, form: &str, valu: Value) {
    let mut sode = StoredNode::new(form);
    sode.valu = Some(valu);
    layr.put_stored_node(iden, sode);
}

/// A bare node for pipeline tests.
pub fn make_node(iden: u64) -> Node {
    Node::new(iden, "it:dev:int", Value::Int(iden as i64))
}

/// Drain a stream into the nodes it yielded.
pub async fn collect_nodes(mut stream: NodePathStream) -> StrataResult<Vec<Node>> {
    let mut nodes = Vec::new();
    while let Some(res) = stream.next().await {
        nodes.push(res?.0);
    }
    Ok(nodes)
}

/// Capture every event a snap fires.
pub fn capture_events(snap: &Snap) -> Arc<Mutex<Vec<SnapEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    snap.on_event(Box::new(move |evnt| {
        sink.lock().unwrap().push(evnt.clone());
    }));
    seen
}
