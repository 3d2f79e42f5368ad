//! Pipeline command behavior.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use common_error::{StrataError, StrataResult};
use strata_core::{CmdArgDef, CmdDef, Identity, Node, NodeId, Value};
use strata_runtime::testing::{
    capture_events, collect_nodes, make_node, seed_node, FnQuery, TestEnv,
};
use strata_runtime::{
    vec_stream, BackgroundCmd, Cmd, HelpCmd, MergeCmd, NodePathStream, ParallelCmd, PureCmd,
    Query, QueryOpts, Runtime, SnapEvent, TeeCmd, ViewExecCmd,
};
use strata_storage::{EditMeta, Layer, MemLayer, NodeEdits, StoredNode, View};

fn query(text: &str) -> Arc<dyn Query> {
    Arc::new(FnQuery::passthrough(text))
}

fn open(env: &TestEnv) -> Arc<Runtime> {
    Runtime::new(query("test"), env.snap(), QueryOpts::default()).unwrap()
}

fn items(idens: &[u64]) -> NodePathStream {
    let nodes: Vec<Node> = idens.iter().map(|iden| make_node(*iden)).collect();
    vec_stream(
        nodes
            .into_iter()
            .map(|node| {
                let path = strata_core::Path::new(HashMap::new(), node.iden);
                (node, path)
            })
            .collect(),
    )
}

fn argv(tokens: &[&str]) -> Vec<Value> {
    tokens.iter().map(|tok| Value::Str(tok.to_string())).collect()
}

// ============================================================================
// parallel
// ============================================================================

#[tokio::test]
async fn test_parallel_forwards_every_item() {
    let env = TestEnv::new();
    // each worker shifts the node iden so outputs are distinguishable
    env.compiler.register(FnQuery::new("shift", |_runt, input| async move {
        let out: NodePathStream = Box::pin(input.map(|res| {
            res.map(|(mut node, path)| {
                node.iden += 100;
                (node, path)
            })
        }));
        Ok(out)
    }));

    let runt = open(&env);
    let mut cmd = ParallelCmd::new(true);
    assert!(cmd
        .set_argv(&runt, &argv(&["--size", "3", "shift"]))
        .unwrap());

    let out = cmd.exec(runt, items(&[1, 2, 3, 4, 5])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();

    let mut idens: Vec<u64> = nodes.iter().map(|n| n.iden).collect();
    idens.sort_unstable();
    assert_eq!(idens, vec![101, 102, 103, 104, 105]);
}

#[tokio::test]
async fn test_parallel_worker_failure_propagates() {
    let env = TestEnv::new();
    env.compiler.register(FnQuery::new("boom", |_runt, input| async move {
        let out: NodePathStream = Box::pin(input.map(|res| {
            res.and_then(|_| Err(StrataError::runtime("worker failed")))
        }));
        Ok(out)
    }));

    let runt = open(&env);
    let mut cmd = ParallelCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["boom"])).unwrap());

    let mut out = cmd.exec(runt, items(&[1])).await.unwrap();
    let mut failed = false;
    while let Some(res) = out.next().await {
        if let Err(err) = res {
            assert!(matches!(err, StrataError::RuntimeError(_)));
            failed = true;
            break;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn test_stream_commands_report_readonly() {
    // forwarding commands never write and stay usable under readonly
    assert!(ParallelCmd::new(true).is_readonly());
    assert!(ViewExecCmd::new(true).is_readonly());
    assert!(TeeCmd::new(true).is_readonly());
    assert!(!MergeCmd::new(true).is_readonly());
}

#[tokio::test]
async fn test_parallel_empty_input_completes() {
    let env = TestEnv::new();
    let runt = open(&env);
    let mut cmd = ParallelCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["noop"])).unwrap());

    let out = cmd.exec(runt, items(&[])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    assert!(nodes.is_empty());
}

// ============================================================================
// tee
// ============================================================================

#[tokio::test]
async fn test_tee_emits_branch_outputs_in_order() {
    let env = TestEnv::new();
    env.compiler.register(FnQuery::new("left", |_runt, input| async move {
        let out: NodePathStream = Box::pin(input.map(|res| {
            res.map(|(mut node, path)| {
                node.iden += 10;
                (node, path)
            })
        }));
        Ok(out)
    }));
    env.compiler.register(FnQuery::new("right", |_runt, input| async move {
        let out: NodePathStream = Box::pin(input.map(|res| {
            res.map(|(mut node, path)| {
                node.iden += 20;
                (node, path)
            })
        }));
        Ok(out)
    }));

    let runt = open(&env);
    let mut cmd = TeeCmd::new(true);
    assert!(cmd
        .set_argv(&runt, &argv(&["--join", "left", "right"]))
        .unwrap());

    let out = cmd.exec(runt, items(&[1, 2])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    let idens: Vec<u64> = nodes.iter().map(|n| n.iden).collect();
    // per inbound node: left output, right output, then the original
    assert_eq!(idens, vec![11, 21, 1, 12, 22, 2]);
}

#[tokio::test]
async fn test_tee_without_join_drops_originals() {
    let env = TestEnv::new();
    let runt = open(&env);
    let mut cmd = TeeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["branch"])).unwrap());

    let out = cmd.exec(runt, items(&[5])).await.unwrap();
    let idens: Vec<u64> = collect_nodes(out)
        .await
        .unwrap()
        .iter()
        .map(|n| n.iden)
        .collect();
    // passthrough branch re-emits the item, the original is not joined
    assert_eq!(idens, vec![5]);
}

#[tokio::test]
async fn test_tee_runtsafe_runs_once_without_input() {
    let env = TestEnv::new();
    seed_node(&env.base_layer, 9, "it:dev:int", Value::Int(9));
    env.compiler.register(FnQuery::new("lift", |runt: Arc<Runtime>, _input| async move {
        let node = runt.snap.get_node(9).await.ok_or_else(|| {
            StrataError::NoSuchIden("9".to_string())
        })?;
        let path = runt.init_path(&node);
        Ok(strata_runtime::once_stream((node, path)))
    }));

    let runt = open(&env);
    let mut cmd = TeeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["lift"])).unwrap());

    let out = cmd.exec(runt, items(&[])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].iden, 9);
}

#[tokio::test]
async fn test_tee_requires_a_query() {
    let env = TestEnv::new();
    let runt = open(&env);
    let mut cmd = TeeCmd::new(true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());

    let err = cmd.exec(runt, items(&[])).await.err().unwrap();
    assert!(matches!(err, StrataError::RuntimeError(_)));
}

#[tokio::test]
async fn test_tee_branch_vars_reach_the_caller() {
    let env = TestEnv::new();
    env.compiler.register(FnQuery::new("setter", |runt: Arc<Runtime>, input| async move {
        runt.set_var("found", Value::Bool(true));
        Ok(input)
    }));

    let runt = open(&env);
    runt.set_var("found", Value::Bool(false));

    let mut cmd = TeeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["setter"])).unwrap());

    let out = cmd.exec(runt.clone(), items(&[1])).await.unwrap();
    collect_nodes(out).await.unwrap();

    assert_eq!(runt.get_var("found"), Some(Value::Bool(true)));
}

// ============================================================================
// background
// ============================================================================

#[tokio::test]
async fn test_background_rejects_non_runtsafe() {
    let env = TestEnv::new();
    let runt = open(&env);
    let mut cmd = BackgroundCmd::new(false);
    assert!(cmd.set_argv(&runt, &argv(&["noop"])).unwrap());

    let err = cmd.exec(runt, items(&[])).await.err().unwrap();
    assert!(matches!(err, StrataError::RuntimeError(_)));
}

#[tokio::test]
async fn test_background_forwards_and_detaches() {
    let env = TestEnv::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<HashMap<String, Value>>(1);
    env.compiler.register(FnQuery::new("detached", move |runt: Arc<Runtime>, input| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(runt.flatten_vars()).await;
            Ok(input)
        }
    }));

    let runt = open(&env);
    runt.set_var("keep", Value::Int(1));
    runt.set_var("drop", runt.get_var("lib").unwrap());

    let mut cmd = BackgroundCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["detached"])).unwrap());

    let out = cmd.exec(runt, items(&[1, 2])).await.unwrap();
    let idens: Vec<u64> = collect_nodes(out)
        .await
        .unwrap()
        .iter()
        .map(|n| n.iden)
        .collect();
    assert_eq!(idens, vec![1, 2]);

    // the detached task got a wire-safe copy of the caller's vars
    let vars = rx.recv().await.unwrap();
    assert_eq!(vars.get("keep"), Some(&Value::Int(1)));
    assert!(!vars.contains_key("drop"));
}

// ============================================================================
// view.exec
// ============================================================================

#[tokio::test]
async fn test_viewexec_reemits_originals() {
    let env = TestEnv::new();
    let (fork, _top) = env.add_fork();
    env.compiler.register(FnQuery::new("probe", |runt: Arc<Runtime>, input| async move {
        runt.printf(format!("running in {}", runt.snap.view.iden));
        Ok(input)
    }));

    let runt = open(&env);
    let seen = capture_events(&runt.snap);

    let mut cmd = ViewExecCmd::new(false);
    assert!(cmd.set_argv(&runt, &argv(&[&fork.iden, "probe"])).unwrap());

    let out = cmd.exec(runt, items(&[4])).await.unwrap();
    let idens: Vec<u64> = collect_nodes(out)
        .await
        .unwrap()
        .iter()
        .map(|n| n.iden)
        .collect();
    assert_eq!(idens, vec![4]);

    // the nested query ran on the target view but printed through its
    // own snap, not ours
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_viewexec_requires_view_read() {
    let env = TestEnv::new();
    let (fork, _top) = env.add_fork();

    let visi = env.core.add_user(Identity::user("u01", "visi"));
    let snap = env.snap_as(visi, env.base_view.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let mut cmd = ViewExecCmd::new(false);
    assert!(cmd.set_argv(&runt, &argv(&[&fork.iden, "probe"])).unwrap());

    let mut out = cmd.exec(runt, items(&[1])).await.unwrap();
    let err = out.next().await.unwrap().unwrap_err();
    assert!(err.is_auth_deny());
}

// ============================================================================
// help and pure commands
// ============================================================================

fn sample_cdef() -> CmdDef {
    let mut degrees = CmdArgDef::new("--degrees");
    degrees.argtype = Some("int".to_string());
    degrees.default = Some(Value::Int(1));
    CmdDef {
        name: "graph.walk".to_string(),
        descr: Some("Walk the graph.".to_string()),
        storm: "walkbody".to_string(),
        cmdargs: vec![degrees],
        asroot: false,
        cmdconf: BTreeMap::from([("color".to_string(), Value::Str("red".into()))]),
    }
}

#[tokio::test]
async fn test_help_lists_commands() {
    let env = TestEnv::new();
    env.core.add_cmd_def(sample_cdef()).unwrap();

    let runt = open(&env);
    let seen = capture_events(&runt.snap);

    let mut cmd = HelpCmd::new(true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());

    let out = cmd.exec(runt, items(&[])).await.unwrap();
    collect_nodes(out).await.unwrap();

    let seen = seen.lock().unwrap();
    let lines: Vec<&str> = seen
        .iter()
        .filter_map(|evnt| match evnt {
            SnapEvent::Print(mesg) => Some(mesg.as_str()),
            _ => None,
        })
        .collect();
    assert!(lines.iter().any(|l| l.contains("graph.walk")));
    assert!(lines
        .iter()
        .any(|l| l.contains("For detailed help on any command, use <cmd> --help")));
}

#[tokio::test]
async fn test_purecmd_runs_body_with_cmdopts() {
    let env = TestEnv::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(Option<Value>, Option<Value>)>(1);
    env.compiler.register(FnQuery::new("walkbody", move |runt: Arc<Runtime>, input| {
        let tx = tx.clone();
        async move {
            let _ = tx
                .send((runt.get_var("cmdopts"), runt.get_var("cmdconf")))
                .await;
            Ok(input)
        }
    }));

    let runt = open(&env);
    let mut cmd = PureCmd::new(sample_cdef(), true);
    assert!(cmd.set_argv(&runt, &argv(&["--degrees", "3"])).unwrap());

    let out = cmd.exec(runt, items(&[1])).await.unwrap();
    let idens: Vec<u64> = collect_nodes(out)
        .await
        .unwrap()
        .iter()
        .map(|n| n.iden)
        .collect();
    assert_eq!(idens, vec![1]);

    let (cmdopts, cmdconf) = rx.recv().await.unwrap();
    let cmdopts = cmdopts.unwrap();
    let opts = cmdopts.as_map().unwrap();
    assert_eq!(opts.get("degrees"), Some(&Value::Int(3)));

    let cmdconf = cmdconf.unwrap();
    assert_eq!(
        cmdconf.as_map().unwrap().get("color"),
        Some(&Value::Str("red".into()))
    );
}

#[tokio::test]
async fn test_purecmd_help_declines_execution() {
    let env = TestEnv::new();
    let runt = open(&env);
    let seen = capture_events(&runt.snap);

    let mut cmd = PureCmd::new(sample_cdef(), true);
    assert!(!cmd.set_argv(&runt, &argv(&["--help"])).unwrap());

    let seen = seen.lock().unwrap();
    assert!(seen
        .iter()
        .any(|evnt| matches!(evnt, SnapEvent::Print(mesg) if mesg.starts_with("usage: graph.walk"))));
}

#[tokio::test]
async fn test_purecmd_asroot_requires_permission() {
    let env = TestEnv::new();
    let visi = env.core.add_user(Identity::user("u01", "visi"));
    let snap = env.snap_as(visi, env.base_view.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let mut cdef = sample_cdef();
    cdef.asroot = true;

    let mut cmd = PureCmd::new(cdef.clone(), true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());
    let err = cmd.exec(runt, items(&[])).await.err().unwrap();
    assert!(err.is_auth_deny());

    // granting cmd.asroot.graph.walk elevates the body
    let allowed = env.core.add_user(
        Identity::user("u02", "ops").allow(&["cmd", "asroot", "graph", "walk"]),
    );
    let snap = env.snap_as(allowed, env.base_view.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let mut cmd = PureCmd::new(cdef, true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());
    let out = cmd.exec(runt, items(&[])).await.unwrap();
    assert!(collect_nodes(out).await.unwrap().is_empty());
}

// ============================================================================
// merge
// ============================================================================

fn seed_fork_delta(env: &TestEnv, top: &strata_storage::MemLayer) {
    // base node
    seed_node(&env.base_layer, 1, "inet:ipv4", Value::Int(1));
    // fork-only delta: a prop, a tag and node data
    let mut delta = StoredNode::new("inet:ipv4");
    delta.props.insert("asn".to_string(), Value::Int(42));
    delta.tags.insert("cno".to_string(), Value::Null);
    top.put_stored_node(1, delta);
    top.put_node_data(1, "score", Value::Int(7));
    top.put_edge(1, "refs", 2);
}

#[tokio::test]
async fn test_merge_requires_fork() {
    let env = TestEnv::new();
    let runt = open(&env);
    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());

    let err = cmd.exec(runt, items(&[])).await.err().unwrap();
    assert!(matches!(err, StrataError::CantMergeView(_)));
}

#[tokio::test]
async fn test_merge_preview_prints_without_applying() {
    let env = TestEnv::new();
    let (fork, top) = env.add_fork();
    seed_fork_delta(&env, &top);

    let snap = env.snap_as(env.root.clone(), fork.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();
    let seen = capture_events(&runt.snap);

    let node = fork.get_node(1).await.unwrap();
    let path = runt.init_path(&node);

    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());

    let out = cmd.exec(runt, vec_stream(vec![(node, path)])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    assert_eq!(nodes.len(), 1);

    let lines: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|evnt| match evnt {
            SnapEvent::Print(mesg) => Some(mesg.clone()),
            _ => None,
        })
        .collect();
    assert!(lines.iter().any(|l| l.contains("inet:ipv4:asn = 42")));
    assert!(lines.iter().any(|l| l.contains("inet:ipv4#cno")));
    assert!(lines.iter().any(|l| l.contains("DATA score = 7")));
    assert!(lines.iter().any(|l| l.contains("+(refs)>")));

    // nothing was written to either layer
    assert_eq!(env.base_layer.batches_applied(), 0);
    assert_eq!(top.batches_applied(), 0);
    assert!(top.get_stored_node(1).await.is_some());
}

#[tokio::test]
async fn test_merge_apply_routes_edits() {
    let env = TestEnv::new();
    let (fork, top) = env.add_fork();
    seed_fork_delta(&env, &top);

    let snap = env.snap_as(env.root.clone(), fork.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let node = fork.get_node(1).await.unwrap();
    let path = runt.init_path(&node);

    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["--apply"])).unwrap());

    let out = cmd.exec(runt, vec_stream(vec![(node, path)])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    assert_eq!(nodes.len(), 1);

    // additive edits landed in the base layer
    let sode = env.base_layer.get_stored_node(1).await.unwrap();
    assert_eq!(sode.props.get("asn"), Some(&Value::Int(42)));
    assert!(sode.tags.contains_key("cno"));
    assert_eq!(
        env.base_layer.get_node_data(1).await,
        vec![("score".to_string(), Value::Int(7))]
    );
    assert_eq!(env.base_layer.get_node_edges(1, None).await.len(), 1);

    // the fork's deltas were erased
    assert!(top.get_stored_node(1).await.is_none());
    assert!(top.get_node_data(1).await.is_empty());
    assert!(top.get_node_edges(1, None).await.is_empty());

    // the re-emitted node reflects the post-merge picture
    assert_eq!(nodes[0].props.get("asn"), Some(&Value::Int(42)));
}

#[tokio::test]
async fn test_merge_diff_enumerates_deltas() {
    let env = TestEnv::new();
    let (fork, top) = env.add_fork();
    seed_fork_delta(&env, &top);

    let snap = env.snap_as(env.root.clone(), fork.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["--diff", "--apply"])).unwrap());

    // no inbound nodes: --diff finds the delta on its own
    let out = cmd.exec(runt, items(&[])).await.unwrap();
    let nodes = collect_nodes(out).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(top.get_stored_node(1).await.is_none());
}

/// Wraps a [`MemLayer`], recording the meta of every edit batch and
/// stalling long enough for the wall clock to move between batches.
struct RecordingLayer {
    inner: MemLayer,
    metas: Mutex<Vec<EditMeta>>,
}

impl RecordingLayer {
    fn new(iden: &str) -> Self {
        Self {
            inner: MemLayer::new(iden),
            metas: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Layer for RecordingLayer {
    fn iden(&self) -> &str {
        self.inner.iden()
    }

    async fn get_stored_node(&self, iden: NodeId) -> Option<StoredNode> {
        self.inner.get_stored_node(iden).await
    }

    async fn get_node_data(&self, iden: NodeId) -> Vec<(String, Value)> {
        self.inner.get_node_data(iden).await
    }

    async fn get_node_edges(&self, iden: NodeId, verb: Option<&str>) -> Vec<(String, NodeId)> {
        self.inner.get_node_edges(iden, verb).await
    }

    async fn stored_node_idens(&self) -> Vec<NodeId> {
        self.inner.stored_node_idens().await
    }

    async fn stor_node_edits(&self, edits: Vec<NodeEdits>, meta: &EditMeta) -> StrataResult<()> {
        self.metas.lock().unwrap().push(meta.clone());
        std::thread::sleep(Duration::from_millis(5));
        self.inner.stor_node_edits(edits, meta).await
    }
}

#[tokio::test]
async fn test_merge_apply_stamps_meta_per_node() {
    let env = TestEnv::new();
    let top = Arc::new(RecordingLayer::new("layr01"));
    let fork = env.core.add_view(View::fork(
        "view01",
        &env.base_view,
        top.clone() as Arc<dyn Layer>,
    ));

    for iden in [1, 2] {
        seed_node(&env.base_layer, iden, "inet:ipv4", Value::Int(iden as i64));
        let mut delta = StoredNode::new("inet:ipv4");
        delta.props.insert("asn".to_string(), Value::Int(42));
        top.inner.put_stored_node(iden, delta);
    }

    let snap = env.snap_as(env.root.clone(), fork.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let mut inbound = Vec::new();
    for iden in [1, 2] {
        let node = fork.get_node(iden).await.unwrap();
        let path = runt.init_path(&node);
        inbound.push((node, path));
    }

    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &argv(&["--apply"])).unwrap());

    let out = cmd.exec(runt, vec_stream(inbound)).await.unwrap();
    assert_eq!(collect_nodes(out).await.unwrap().len(), 2);

    // one meta per node, stamped when that node's merge began
    let metas = top.metas.lock().unwrap();
    assert_eq!(metas.len(), 2);
    assert_eq!(metas[0].user, "root");
    assert!(metas[0].time < metas[1].time);
}

#[tokio::test]
async fn test_merge_checks_permissions_in_preview() {
    let env = TestEnv::new();
    let (fork, top) = env.add_fork();
    seed_fork_delta(&env, &top);

    let visi = env.core.add_user(Identity::user("u01", "visi"));
    let snap = env.snap_as(visi, fork.clone());
    let runt = Runtime::new(query("test"), snap, QueryOpts::default()).unwrap();

    let node = fork.get_node(1).await.unwrap();
    let path = runt.init_path(&node);

    let mut cmd = MergeCmd::new(true);
    assert!(cmd.set_argv(&runt, &[]).unwrap());

    let mut out = cmd.exec(runt, vec_stream(vec![(node, path)])).await.unwrap();
    let err = out.next().await.unwrap().unwrap_err();
    assert!(err.is_auth_deny());
}
