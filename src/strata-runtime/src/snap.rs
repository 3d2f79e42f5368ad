//! Snaps: transaction-scoped node access over a view.
//!
//! A snap binds an acting user to a view, caches live node reads, fans
//! print and warning events out to synchronous listeners, and memoizes
//! remote service handles for the duration of the transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use common_error::{StrataError, StrataResult};
use strata_core::{Identity, Node, NodeId};
use strata_storage::View;

use crate::core::{Core, RemoteHandle};
use crate::runtime::{QueryOpts, Runtime};
use crate::stream::NodePathStream;

/// Events a snap fans out to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapEvent {
    /// Informational output line.
    Print(String),
    /// Warning line; `first` is false for deduplicated repeats.
    Warn { mesg: String, first: bool },
}

type EventFn = Box<dyn Fn(&SnapEvent) + Send + Sync>;

/// Transaction-scoped access to the nodes of a view.
pub struct Snap {
    core: Arc<Core>,
    /// The view the snap reads and writes.
    pub view: Arc<View>,
    /// The acting user.
    pub user: Arc<Identity>,
    livenodes: Mutex<HashMap<NodeId, Node>>,
    listeners: Mutex<Vec<EventFn>>,
    warned: Mutex<HashSet<String>>,
    remotes: tokio::sync::Mutex<HashMap<(String, Vec<(String, String)>), Arc<dyn RemoteHandle>>>,
}

impl Snap {
    /// Open a snap against a view for an acting user.
    pub fn new(core: Arc<Core>, user: Arc<Identity>, view: Arc<View>) -> Arc<Self> {
        Arc::new(Self {
            core,
            view,
            user,
            livenodes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            warned: Mutex::new(HashSet::new()),
            remotes: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a synchronous event listener.
    pub fn on_event(&self, func: EventFn) {
        self.listeners.lock().unwrap().push(func);
    }

    fn fire(&self, evnt: &SnapEvent) {
        for func in self.listeners.lock().unwrap().iter() {
            func(evnt);
        }
    }

    /// Emit an informational line.
    pub fn printf(&self, mesg: impl Into<String>) {
        self.fire(&SnapEvent::Print(mesg.into()));
    }

    /// Emit a warning line.
    pub fn warn(&self, mesg: impl Into<String>) {
        let mesg = mesg.into();
        tracing::warn!(target: "strata::snap", "{mesg}");
        self.fire(&SnapEvent::Warn { mesg, first: true });
    }

    /// Emit a warning line at most once per snap.
    pub fn warn_once(&self, mesg: impl Into<String>) {
        let mesg = mesg.into();
        let first = self.warned.lock().unwrap().insert(mesg.clone());
        if first {
            tracing::warn!(target: "strata::snap", "{mesg}");
        }
        self.fire(&SnapEvent::Warn { mesg, first });
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Get the merged picture of a node, cached for the snap's lifetime.
    pub async fn get_node(&self, iden: NodeId) -> Option<Node> {
        if let Some(node) = self.livenodes.lock().unwrap().get(&iden) {
            return Some(node.clone());
        }
        let node = self.view.get_node(iden).await?;
        self.livenodes.lock().unwrap().insert(iden, node.clone());
        Some(node)
    }

    /// Drop a node from the live cache so the next read observes
    /// freshly applied edits.
    pub fn clear_cached(&self, iden: NodeId) {
        self.livenodes.lock().unwrap().remove(&iden);
    }

    // ========================================================================
    // Remote services
    // ========================================================================

    /// Open a remote service handle, memoized by URL and options.
    pub async fn get_remote(
        &self,
        url: &str,
        opts: &BTreeMap<String, String>,
    ) -> StrataResult<Arc<dyn RemoteHandle>> {
        let key = (
            url.to_string(),
            opts.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
        );
        let mut remotes = self.remotes.lock().await;
        if let Some(handle) = remotes.get(&key) {
            return Ok(handle.clone());
        }
        let connector = self.core.connector().ok_or_else(|| {
            StrataError::not_implemented("No remote connector is configured")
        })?;
        let handle = connector.open(url, opts).await?;
        remotes.insert(key, handle.clone());
        Ok(handle)
    }

    // ========================================================================
    // Query entry
    // ========================================================================

    /// Compile and run query text against this snap.
    pub async fn storm(
        self: &Arc<Self>,
        text: &str,
        opts: QueryOpts,
    ) -> StrataResult<NodePathStream> {
        let query = self.core.get_query(text)?;
        let runt = Runtime::new(query, self.clone(), opts)?;
        runt.execute(None).await
    }
}
