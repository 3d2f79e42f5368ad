//! Query runtimes.
//!
//! A [`Runtime`] is the execution context for one compiled query: it
//! owns a variable scope within the query tree's shared arena, tracks
//! runtime-safety classifications, enforces permissions for the acting
//! user, and drives the query pipeline over its input stream.
//!
//! Nested runtimes (sub, command, worker) differ only in how their scope
//! and snap relate to the parent's; all of them share the parent's
//! cancellation signal, so cancelling the root tears down the whole
//! tree.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use common_error::{StrataError, StrataResult};
use futures::future::{BoxFuture, Future};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use strata_core::{Identity, Node, NodeId, Path, Value};

use crate::core::Query;
use crate::scope::{BuiltinKind, RuntVars, ScopeArena, ScopeId};
use crate::snap::Snap;
use crate::stream::{pipeline_stream, NodePathStream};

static RUNTIME_IDEN: AtomicU64 = AtomicU64::new(1);

/// Options for opening a runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOpts {
    /// Target view iden; `None` uses the snap's view.
    #[serde(default)]
    pub view: Option<String>,
    /// Acting user iden; `None` uses the snap's user.
    #[serde(default)]
    pub user: Option<String>,
    /// Variables seeded into the runtime's scope.
    #[serde(default)]
    pub vars: HashMap<String, Value>,
    /// Node idens appended to the input stream after seeded inputs.
    #[serde(default)]
    pub idens: Vec<NodeId>,
    /// Reject queries that would write.
    #[serde(default)]
    pub readonly: bool,
    /// Free-form options readable via `get_opt`.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl QueryOpts {
    /// Options that only seed variables.
    pub fn with_vars(vars: HashMap<String, Value>) -> Self {
        Self {
            vars,
            ..Self::default()
        }
    }
}

/// Execution context for one compiled query.
pub struct Runtime {
    iden: u64,
    query: Arc<dyn Query>,
    /// The snap this runtime reads and writes through.
    pub snap: Arc<Snap>,
    /// The acting user.
    pub user: Arc<Identity>,
    opts: Mutex<QueryOpts>,
    scopes: Arc<Mutex<ScopeArena>>,
    scope: ScopeId,
    runtvars: RuntVars,
    asroot: AtomicBool,
    readonly: bool,
    inputs: Mutex<Vec<Node>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Open a root runtime against a snap.
    pub fn new(
        query: Arc<dyn Query>,
        snap: Arc<Snap>,
        opts: QueryOpts,
    ) -> StrataResult<Arc<Self>> {
        let user = match &opts.user {
            Some(iden) => snap.core().get_user(iden).ok_or_else(|| {
                StrataError::NoSuchName(format!("No user with iden: {iden}"))
            })?,
            None => snap.user.clone(),
        };

        let mut arena = ScopeArena::new();
        let scope = arena.alloc(None, false, opts.vars.clone());
        let scopes = Arc::new(Mutex::new(arena));

        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Self::build(
            query,
            snap,
            user,
            opts,
            scopes,
            scope,
            RuntVars::seeded(),
            false,
            (Arc::new(cancel_tx), cancel_rx),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        query: Arc<dyn Query>,
        snap: Arc<Snap>,
        user: Arc<Identity>,
        opts: QueryOpts,
        scopes: Arc<Mutex<ScopeArena>>,
        scope: ScopeId,
        mut runtvars: RuntVars,
        asroot: bool,
        cancel: (Arc<watch::Sender<bool>>, watch::Receiver<bool>),
    ) -> Arc<Self> {
        // initial vars and builtins are runtime-safe by construction
        for name in opts.vars.keys() {
            runtvars.force(name.clone(), true);
        }
        for kind in BuiltinKind::ALL {
            runtvars.force(kind.name(), true);
        }

        let readonly = opts.readonly;
        let mut runt = Self {
            iden: RUNTIME_IDEN.fetch_add(1, Ordering::Relaxed),
            query,
            snap,
            user,
            opts: Mutex::new(opts),
            scopes,
            scope,
            runtvars,
            asroot: AtomicBool::new(asroot),
            readonly,
            inputs: Mutex::new(Vec::new()),
            cancel_tx: cancel.0,
            cancel_rx: cancel.1,
        };

        let classes = runt.query.runt_vars(&runt);
        for (name, runtsafe) in classes {
            runt.runtvars.mark(name, runtsafe);
        }

        Arc::new(runt)
    }

    /// Stable runtime iden, unique within the process.
    pub fn iden(&self) -> u64 {
        self.iden
    }

    /// The compiled query this runtime executes.
    pub fn query(&self) -> &Arc<dyn Query> {
        &self.query
    }

    // ========================================================================
    // Nested runtimes
    // ========================================================================

    /// Open a nested runtime whose scope chains to this one.
    ///
    /// When `opts` names a different view, the caller must hold
    /// `view.read` on it and the nested runtime gets a fresh snap.
    pub fn get_sub_runtime(
        self: &Arc<Self>,
        query: Arc<dyn Query>,
        opts: Option<QueryOpts>,
    ) -> StrataResult<Arc<Runtime>> {
        let opts = opts.unwrap_or_default();

        let mut snap = self.snap.clone();
        if let Some(viewiden) = &opts.view {
            let view = self.snap.core().require_view(viewiden)?;
            if !Arc::ptr_eq(&view, &self.snap.view) {
                self.confirm(&["view", "read"], Some(&view.iden))?;
                snap = Snap::new(self.snap.core().clone(), self.user.clone(), view);
            }
        }

        let scope = self
            .scopes
            .lock()
            .unwrap()
            .alloc(Some(self.scope), false, opts.vars.clone());

        let mut runtvars = RuntVars::seeded();
        runtvars.inherit(&self.runtvars);

        Ok(Self::build(
            query,
            snap,
            self.user.clone(),
            opts,
            self.scopes.clone(),
            scope,
            runtvars,
            self.is_asroot(),
            (self.cancel_tx.clone(), self.cancel_rx.clone()),
        ))
    }

    /// Open an isolated runtime for a command body.
    ///
    /// The scope is a fresh root in the same arena: command bodies see
    /// only the vars they were handed, and their writes never reach the
    /// calling query.
    pub fn get_cmd_runtime(
        self: &Arc<Self>,
        query: Arc<dyn Query>,
        vars: HashMap<String, Value>,
    ) -> Arc<Runtime> {
        let scope = self.scopes.lock().unwrap().alloc(None, false, vars.clone());

        let opts = QueryOpts {
            readonly: self.readonly,
            ..QueryOpts::with_vars(vars)
        };

        Self::build(
            query,
            self.snap.clone(),
            self.user.clone(),
            opts,
            self.scopes.clone(),
            scope,
            RuntVars::seeded(),
            false,
            (self.cancel_tx.clone(), self.cancel_rx.clone()),
        )
    }

    /// Open a hard-isolated runtime for a fan-out worker.
    ///
    /// The worker gets a flattened copy of this runtime's vars in its
    /// own arena and an independent snap, so concurrent workers never
    /// contend on shared scope or cache state.
    pub fn get_worker_runtime(self: &Arc<Self>, query: Arc<dyn Query>) -> Arc<Runtime> {
        let vars = self.flatten_vars();

        let mut arena = ScopeArena::new();
        let scope = arena.alloc(None, false, vars.clone());
        let scopes = Arc::new(Mutex::new(arena));

        let snap = Snap::new(
            self.snap.core().clone(),
            self.snap.user.clone(),
            self.snap.view.clone(),
        );

        let mut runtvars = RuntVars::seeded();
        runtvars.inherit(&self.runtvars);

        let opts = QueryOpts {
            readonly: self.readonly,
            ..QueryOpts::default()
        };

        Self::build(
            query,
            snap,
            self.user.clone(),
            opts,
            scopes,
            scope,
            runtvars,
            self.is_asroot(),
            (self.cancel_tx.clone(), self.cancel_rx.clone()),
        )
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// Get a variable, constructing and memoizing builtin namespaces on
    /// first reference.
    pub fn get_var(&self, name: &str) -> Option<Value> {
        let mut scopes = self.scopes.lock().unwrap();
        if let Some(valu) = scopes.get_local(self.scope, name) {
            return Some(valu);
        }
        if let Some(kind) = BuiltinKind::lookup(name) {
            let valu = kind.construct(self.iden);
            scopes.set_local(self.scope, name, valu.clone());
            return Some(valu);
        }
        scopes.get(self.scope, name)
    }

    /// Set a variable, delegating to the owning parent scope when the
    /// name is not local.
    pub fn set_var(&self, name: &str, valu: Value) {
        self.scopes.lock().unwrap().set(self.scope, name, valu);
    }

    /// Remove a variable, delegating like `set_var`.
    pub fn pop_var(&self, name: &str) -> Option<Value> {
        self.scopes.lock().unwrap().pop(self.scope, name)
    }

    /// This runtime's local vars, without the parent chain.
    pub fn local_vars(&self) -> HashMap<String, Value> {
        self.scopes.lock().unwrap().local_vars(self.scope)
    }

    /// The full variable picture, nearest scope winning.
    pub fn flatten_vars(&self) -> HashMap<String, Value> {
        self.scopes.lock().unwrap().flatten(self.scope)
    }

    /// True when the name is classified runtime-safe.
    pub fn is_runtsafe(&self, name: &str) -> bool {
        self.runtvars.is_runtsafe(name)
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Read a free-form runtime option.
    pub fn get_opt(&self, name: &str) -> Option<Value> {
        self.opts.lock().unwrap().extra.get(name).cloned()
    }

    /// Set a free-form runtime option.
    pub fn set_opt(&self, name: impl Into<String>, valu: Value) {
        self.opts.lock().unwrap().extra.insert(name.into(), valu);
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// True when the runtime was elevated by a permission-gated command.
    pub fn is_asroot(&self) -> bool {
        self.asroot.load(Ordering::Relaxed)
    }

    /// Elevate or drop the runtime's asroot state.
    pub fn set_asroot(&self, asroot: bool) {
        self.asroot.store(asroot, Ordering::Relaxed);
    }

    /// Check a permission without failing.
    pub fn allowed(&self, perm: &[&str], gate: Option<&str>) -> bool {
        self.is_asroot() || self.user.allowed(perm, gate)
    }

    /// Require a permission, failing with `AuthDeny` when absent.
    pub fn confirm(&self, perm: &[&str], gate: Option<&str>) -> StrataResult<()> {
        if self.is_asroot() {
            return Ok(());
        }
        self.user.confirm(perm, gate)
    }

    /// Require a permission on the snap's write layer.
    pub fn layer_confirm(&self, perm: &[&str]) -> StrataResult<()> {
        let gate = self.snap.view.top_layer().iden().to_string();
        self.confirm(perm, Some(&gate))
    }

    /// True when the acting user is an admin.
    pub fn is_admin(&self, gate: Option<&str>) -> bool {
        self.is_asroot() || self.user.is_admin(gate)
    }

    /// True when the runtime rejects writes.
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Fail with `RuntimeError` when the runtime is readonly.
    pub fn confirm_mutable(&self) -> StrataResult<()> {
        if self.readonly {
            return Err(StrataError::runtime(
                "Runtime is in readonly mode, cannot execute write operations.",
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Emit an informational line through the snap.
    pub fn printf(&self, mesg: impl Into<String>) {
        self.snap.printf(mesg);
    }

    /// Emit a warning line through the snap.
    pub fn warn(&self, mesg: impl Into<String>) {
        self.snap.warn(mesg);
    }

    /// Emit a warning at most once per snap.
    pub fn warn_once(&self, mesg: impl Into<String>) {
        self.snap.warn_once(mesg);
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel this runtime and every nested runtime sharing its tree.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// True once the query tree was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    // ========================================================================
    // Inputs and execution
    // ========================================================================

    /// Seed a node into the input stream.
    pub fn add_input(&self, node: Node) {
        self.inputs.lock().unwrap().push(node);
    }

    /// Create the initial path for a node entering the pipeline here.
    pub fn init_path(&self, node: &Node) -> Path {
        Path::new(self.local_vars(), node.iden)
    }

    fn input_stream(self: &Arc<Self>) -> NodePathStream {
        let runt = self.clone();
        let nodes: Vec<Node> = std::mem::take(&mut *self.inputs.lock().unwrap());
        let idens: Vec<NodeId> = self.opts.lock().unwrap().idens.clone();
        let capacity = self.snap.core().config().pipeline.stage_capacity;

        pipeline_stream(capacity, move |out| async move {
            for node in nodes {
                let path = runt.init_path(&node);
                out.feed((node, path)).await?;
            }
            for iden in idens {
                let Some(node) = runt.snap.get_node(iden).await else {
                    return Err(StrataError::NoSuchIden(format!("{iden:016x}")));
                };
                let path = runt.init_path(&node);
                out.feed((node, path)).await?;
            }
            Ok(())
        })
    }

    /// Drive the query over `genr`, or over the runtime's own inputs
    /// when `genr` is `None`.
    ///
    /// The returned stream observes cancellation between items.
    pub async fn execute(
        self: &Arc<Self>,
        genr: Option<NodePathStream>,
    ) -> StrataResult<NodePathStream> {
        self.query.validate(self)?;
        let input = genr.unwrap_or_else(|| self.input_stream());
        let out = self.query.run(self.clone(), input).await?;
        Ok(Box::pin(TickStream::new(out, self.cancel_rx.clone())))
    }
}

/// Output wrapper that observes the tree's cancellation signal and fuses
/// after the first error.
///
/// The cancellation check is a polled future, not a flag read, so a
/// consumer parked on a quiet inner stream is woken the moment the tree
/// is cancelled.
struct TickStream {
    inner: NodePathStream,
    cancelled: BoxFuture<'static, ()>,
    done: bool,
}

impl TickStream {
    fn new(inner: NodePathStream, mut cancel_rx: watch::Receiver<bool>) -> Self {
        let cancelled = Box::pin(async move {
            while !*cancel_rx.borrow() {
                if cancel_rx.changed().await.is_err() {
                    // sender gone: this tree can never be cancelled
                    futures::future::pending::<()>().await;
                }
            }
        });
        Self {
            inner,
            cancelled,
            done: false,
        }
    }
}

impl Stream for TickStream {
    type Item = StrataResult<crate::stream::NodePath>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.done = true;
            return Poll::Ready(Some(Err(StrataError::cancelled("query cancelled"))));
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}
