//! Daemons: supervised, long-running queries.
//!
//! A daemon runs its query in a loop under supervision. Clean exits and
//! recoverable errors put the daemon to sleep for a fixed back-off and
//! restart it; a missing view is fatal and stops the loop. Every print
//! and warning from the daemon's query lands in a bounded run log.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use common_error::StrataError;
use common_error::StrataResult;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use strata_core::{DaemonDef, Identity};

use crate::core::{now_millis, Core};
use crate::runtime::QueryOpts;
use crate::snap::{Snap, SnapEvent};

/// Lifecycle state of a daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DaemonStatus {
    /// Registered, never started.
    Initialized,
    /// The query is executing.
    Running,
    /// The query exited cleanly; the loop is backing off.
    Sleeping,
    /// Stopped by request.
    Stopped,
    /// The loop cannot continue (e.g. the target view is gone).
    FatalError(String),
    /// The query failed; the loop is backing off before a restart.
    Error(String),
}

/// One run-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLogEntry {
    /// Epoch millis when the event fired.
    pub time: i64,
    /// `print`, `warn` or `err`.
    pub kind: String,
    /// The event text.
    pub mesg: String,
}

/// Packed daemon summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub iden: String,
    pub name: String,
    pub user: String,
    pub enabled: bool,
    /// Nodes the query yielded across all iterations.
    pub count: u64,
    pub status: DaemonStatus,
    /// True once an error event fired during the current run.
    pub err: bool,
}

/// A supervised, long-running query.
pub struct Daemon {
    iden: String,
    ddef: DaemonDef,
    core: Arc<Core>,
    user: Arc<Identity>,
    status: Mutex<DaemonStatus>,
    count: AtomicU64,
    err_evnt: AtomicBool,
    runlog: Mutex<VecDeque<DaemonLogEntry>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Daemon {
    /// Create a daemon from its definition, resolving the owning user.
    pub fn new(core: Arc<Core>, ddef: DaemonDef) -> StrataResult<Arc<Self>> {
        ddef.validate()?;
        let user = core.get_user(&ddef.user).ok_or_else(|| {
            StrataError::NoSuchName(format!("No user with iden: {}", ddef.user))
        })?;
        Ok(Arc::new(Self {
            iden: ddef.iden.clone(),
            ddef,
            core,
            user,
            status: Mutex::new(DaemonStatus::Initialized),
            count: AtomicU64::new(0),
            err_evnt: AtomicBool::new(false),
            runlog: Mutex::new(VecDeque::new()),
            task: Mutex::new(None),
        }))
    }

    pub fn iden(&self) -> &str {
        &self.iden
    }

    pub fn ddef(&self) -> &DaemonDef {
        &self.ddef
    }

    /// Current lifecycle state.
    pub fn status(&self) -> DaemonStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: DaemonStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Packed summary for remote callers.
    pub fn pack(&self) -> DaemonInfo {
        DaemonInfo {
            iden: self.iden.clone(),
            name: self.ddef.name.clone(),
            user: self.ddef.user.clone(),
            enabled: self.ddef.enabled,
            count: self.count.load(Ordering::Relaxed),
            status: self.status(),
            err: self.err_evnt.load(Ordering::Relaxed),
        }
    }

    /// The run log, oldest entry first.
    pub fn runlog(&self) -> Vec<DaemonLogEntry> {
        self.runlog.lock().unwrap().iter().cloned().collect()
    }

    fn add_runlog(&self, kind: &str, mesg: String) {
        let capacity = self.core.config().daemon.runlog_capacity;
        let mut runlog = self.runlog.lock().unwrap();
        while runlog.len() >= capacity {
            runlog.pop_front();
        }
        runlog.push_back(DaemonLogEntry {
            time: now_millis(),
            kind: kind.to_string(),
            mesg,
        });
    }

    /// Start the supervision loop. A running daemon is left alone.
    pub fn run(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let daemon = self.clone();
        *task = Some(common_runtime::spawn(daemon.dmon_loop()));
    }

    /// Stop the supervision loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            if !handle.is_finished() {
                self.set_status(DaemonStatus::Stopped);
            }
            handle.abort();
        }
    }

    /// Restart the supervision loop.
    pub fn bump(self: &Arc<Self>) {
        self.stop();
        self.run();
    }

    async fn dmon_loop(self: Arc<Self>) {
        tracing::info!(target: "strata::daemon", iden = %self.iden, "daemon starting");
        loop {
            let view = self
                .ddef
                .stormopts
                .view
                .as_deref()
                .and_then(|iden| self.core.get_view(iden));
            let Some(view) = view else {
                tracing::warn!(
                    target: "strata::daemon",
                    iden = %self.iden,
                    "daemon view is invalid, stopping the daemon",
                );
                self.set_status(DaemonStatus::FatalError(
                    "daemon view is invalid".to_string(),
                ));
                return;
            };

            self.err_evnt.store(false, Ordering::Relaxed);
            self.set_status(DaemonStatus::Running);

            let snap = Snap::new(self.core.clone(), self.user.clone(), view);
            let daemon = self.clone();
            snap.on_event(Box::new(move |evnt| match evnt {
                SnapEvent::Print(mesg) => daemon.add_runlog("print", mesg.clone()),
                SnapEvent::Warn { mesg, .. } => daemon.add_runlog("warn", mesg.clone()),
            }));

            let vars: HashMap<_, _> = self
                .ddef
                .stormopts
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let opts = QueryOpts::with_vars(vars);

            let failure = self.run_once(&snap, opts).await;
            match failure {
                None => {
                    tracing::info!(
                        target: "strata::daemon",
                        iden = %self.iden,
                        "daemon query exited",
                    );
                    self.set_status(DaemonStatus::Sleeping);
                }
                Some(StrataError::QueryExit) => {
                    self.set_status(DaemonStatus::Sleeping);
                }
                Some(err) if err.is_cancelled() => {
                    self.set_status(DaemonStatus::Stopped);
                    return;
                }
                Some(err) => {
                    let mesg = err.to_string();
                    tracing::error!(
                        target: "strata::daemon",
                        iden = %self.iden,
                        "daemon error: {mesg}",
                    );
                    self.add_runlog("err", mesg.clone());
                    self.err_evnt.store(true, Ordering::Relaxed);
                    self.set_status(DaemonStatus::Error(mesg));
                }
            }

            tokio::time::sleep(self.core.config().daemon.backoff()).await;
        }
    }

    /// One supervised pass over the daemon's query.
    async fn run_once(&self, snap: &Arc<Snap>, opts: QueryOpts) -> Option<StrataError> {
        let mut stream = match snap.storm(&self.ddef.storm, opts).await {
            Ok(stream) => stream,
            Err(err) => return Some(err),
        };
        while let Some(res) = stream.next().await {
            match res {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    common_runtime::yield_now().await;
                }
                Err(err) => return Some(err),
            }
        }
        None
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Registry and lifecycle manager for daemons.
pub struct DaemonManager {
    core: Arc<Core>,
    daemons: Mutex<Vec<Arc<Daemon>>>,
    enabled: AtomicBool,
}

impl DaemonManager {
    /// Create a manager. Daemons added while the manager is disabled
    /// stay registered but do not start.
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            daemons: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Register a daemon, starting it when both the manager and the
    /// definition are enabled.
    pub fn add_daemon(&self, ddef: DaemonDef) -> StrataResult<Arc<Daemon>> {
        let daemon = Daemon::new(self.core.clone(), ddef)?;
        self.daemons.lock().unwrap().push(daemon.clone());
        if self.enabled.load(Ordering::Relaxed) && daemon.ddef().enabled {
            daemon.run();
        }
        Ok(daemon)
    }

    /// Look up a daemon by iden.
    pub fn get_daemon(&self, iden: &str) -> Option<Arc<Daemon>> {
        self.daemons
            .lock()
            .unwrap()
            .iter()
            .find(|daemon| daemon.iden() == iden)
            .cloned()
    }

    /// Remove and stop a daemon.
    pub fn pop_daemon(&self, iden: &str) -> Option<Arc<Daemon>> {
        let mut daemons = self.daemons.lock().unwrap();
        let pos = daemons.iter().position(|daemon| daemon.iden() == iden)?;
        let daemon = daemons.remove(pos);
        daemon.stop();
        Some(daemon)
    }

    /// Packed summary for one daemon.
    pub fn get_daemon_def(&self, iden: &str) -> Option<DaemonInfo> {
        self.get_daemon(iden).map(|daemon| daemon.pack())
    }

    /// Packed summaries for every registered daemon, in registration
    /// order.
    pub fn get_daemon_defs(&self) -> Vec<DaemonInfo> {
        self.daemons
            .lock()
            .unwrap()
            .iter()
            .map(|daemon| daemon.pack())
            .collect()
    }

    /// The run log for one daemon.
    pub fn get_runlog(&self, iden: &str) -> Option<Vec<DaemonLogEntry>> {
        self.get_daemon(iden).map(|daemon| daemon.runlog())
    }

    /// Start every enabled daemon.
    pub fn start(&self) {
        if self.enabled.swap(true, Ordering::Relaxed) {
            return;
        }
        for daemon in self.daemons.lock().unwrap().iter() {
            if daemon.ddef().enabled {
                daemon.run();
            }
        }
    }

    /// Stop every daemon, leaving them registered.
    pub fn stop(&self) {
        if !self.enabled.swap(false, Ordering::Relaxed) {
            return;
        }
        for daemon in self.daemons.lock().unwrap().iter() {
            daemon.stop();
        }
    }

    /// Stop and drop every daemon.
    pub fn finalize(&self) {
        for daemon in self.daemons.lock().unwrap().drain(..) {
            daemon.stop();
        }
    }
}
