//! The runtime core: shared services behind every runtime.
//!
//! The core owns the view and user registries, the compiled-query cache,
//! the declarative command definitions, and the set of detached
//! background tasks. It deliberately does not own the daemon manager;
//! that is constructed against a core so neither holds the other alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use common_config::StrataConfig;
use common_error::{StrataError, StrataResult};
use common_runtime::JoinSet;
use strata_core::{CmdDef, Identity, TypeModel};
use strata_storage::View;

use crate::runtime::Runtime;
use crate::snap::Snap;
use crate::stream::NodePathStream;

/// Current wall clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Query seam
// ============================================================================

/// A compiled query.
///
/// Parsing and compilation live outside this crate; the runtime drives a
/// compiled query as a pipeline over its input stream.
#[async_trait]
pub trait Query: Send + Sync {
    /// The source text the query was compiled from.
    fn text(&self) -> &str;

    /// Variable names this query assigns, with the compiler's
    /// runtime-safety classification for each.
    fn runt_vars(&self, runt: &Runtime) -> Vec<(String, bool)>;

    /// Check the query against a runtime before execution (readonly
    /// enforcement, required permissions).
    fn validate(&self, _runt: &Runtime) -> StrataResult<()> {
        Ok(())
    }

    /// Run the query as a pipeline over `input`.
    async fn run(&self, runt: Arc<Runtime>, input: NodePathStream) -> StrataResult<NodePathStream>;
}

/// Compiles query text into executable queries.
pub trait QueryCompiler: Send + Sync {
    /// Compile query text, failing with `BadSyntax` on malformed input.
    fn compile(&self, text: &str) -> StrataResult<Arc<dyn Query>>;
}

// ============================================================================
// Remote seam
// ============================================================================

/// A handle to an opened remote service.
pub trait RemoteHandle: Send + Sync {
    /// The URL the handle was opened against.
    fn url(&self) -> &str;
}

/// Opens connections to remote services on behalf of a snap.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open (or fail to open) a remote service.
    async fn open(
        &self,
        url: &str,
        opts: &BTreeMap<String, String>,
    ) -> StrataResult<Arc<dyn RemoteHandle>>;
}

// ============================================================================
// Core
// ============================================================================

/// Shared services for every runtime opened against this host.
pub struct Core {
    config: StrataConfig,
    compiler: Arc<dyn QueryCompiler>,
    model: Arc<dyn TypeModel>,
    connector: Mutex<Option<Arc<dyn Connector>>>,
    views: Mutex<HashMap<String, Arc<View>>>,
    users: Mutex<HashMap<String, Arc<Identity>>>,
    queries: Mutex<HashMap<String, Arc<dyn Query>>>,
    cmddefs: Mutex<BTreeMap<String, CmdDef>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Core {
    /// Create a core with default configuration.
    pub fn new(compiler: Arc<dyn QueryCompiler>, model: Arc<dyn TypeModel>) -> Arc<Self> {
        Self::with_config(compiler, model, StrataConfig::default())
    }

    /// Create a core with explicit configuration.
    pub fn with_config(
        compiler: Arc<dyn QueryCompiler>,
        model: Arc<dyn TypeModel>,
        config: StrataConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            compiler,
            model,
            connector: Mutex::new(None),
            views: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            cmddefs: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Attach a remote connector.
    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self.connector.lock().unwrap() = Some(connector);
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn model(&self) -> Arc<dyn TypeModel> {
        self.model.clone()
    }

    pub fn connector(&self) -> Option<Arc<dyn Connector>> {
        self.connector.lock().unwrap().clone()
    }

    // ========================================================================
    // Registries
    // ========================================================================

    /// Register a view.
    pub fn add_view(&self, view: View) -> Arc<View> {
        let view = Arc::new(view);
        self.views
            .lock()
            .unwrap()
            .insert(view.iden.clone(), view.clone());
        view
    }

    /// Look up a view by iden.
    pub fn get_view(&self, iden: &str) -> Option<Arc<View>> {
        self.views.lock().unwrap().get(iden).cloned()
    }

    /// Look up a view, failing with `NoSuchView`.
    pub fn require_view(&self, iden: &str) -> StrataResult<Arc<View>> {
        self.get_view(iden)
            .ok_or_else(|| StrataError::NoSuchView(format!("No view with iden: {iden}")))
    }

    /// Register an identity.
    pub fn add_user(&self, user: Identity) -> Arc<Identity> {
        let user = Arc::new(user);
        self.users
            .lock()
            .unwrap()
            .insert(user.iden.clone(), user.clone());
        user
    }

    /// Look up an identity by iden.
    pub fn get_user(&self, iden: &str) -> Option<Arc<Identity>> {
        self.users.lock().unwrap().get(iden).cloned()
    }

    // ========================================================================
    // Queries and commands
    // ========================================================================

    /// Compile query text, memoized by exact text.
    pub fn get_query(&self, text: &str) -> StrataResult<Arc<dyn Query>> {
        if let Some(query) = self.queries.lock().unwrap().get(text) {
            return Ok(query.clone());
        }
        let query = self.compiler.compile(text)?;
        self.queries
            .lock()
            .unwrap()
            .insert(text.to_string(), query.clone());
        Ok(query)
    }

    /// Register a declarative command definition.
    pub fn add_cmd_def(&self, cdef: CmdDef) -> StrataResult<()> {
        cdef.validate()?;
        self.cmddefs
            .lock()
            .unwrap()
            .insert(cdef.name.clone(), cdef);
        Ok(())
    }

    /// Look up a command definition by name.
    pub fn get_cmd_def(&self, name: &str) -> Option<CmdDef> {
        self.cmddefs.lock().unwrap().get(name).cloned()
    }

    /// Every registered command definition, ordered by name.
    pub fn cmd_defs(&self) -> Vec<CmdDef> {
        self.cmddefs.lock().unwrap().values().cloned().collect()
    }

    // ========================================================================
    // Snaps and background tasks
    // ========================================================================

    /// Open a snap against a view for an acting user.
    pub fn snap(self: &Arc<Self>, user: Arc<Identity>, view: Arc<View>) -> Arc<Snap> {
        Snap::new(self.clone(), user, view)
    }

    /// Detach a task from its parent query.
    ///
    /// The task survives the parent runtime and is torn down with the
    /// core.
    pub fn sched_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().spawn(future);
    }

    /// Abort every detached task.
    pub fn finalize(&self) {
        self.tasks.lock().unwrap().abort_all();
    }
}
