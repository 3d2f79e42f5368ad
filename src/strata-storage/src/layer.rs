//! Layer trait and the in-memory backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use common_error::StrataResult;
use strata_core::{NodeId, Value};

use crate::types::{Edit, EditMeta, NodeEdits, StoredNode};

/// An ordered, independently writable storage segment within a view.
///
/// Mutations within one layer are serialized by the storage backend; the
/// runtime core sequences its own batches and assumes at most one
/// in-flight writer per layer per batch.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Stable layer iden; also the auth gate for layer-scoped permissions.
    fn iden(&self) -> &str;

    /// The stored representation of a node in this layer, if any.
    async fn get_stored_node(&self, iden: NodeId) -> Option<StoredNode>;

    /// Opaque node data blobs stored for a node in this layer.
    async fn get_node_data(&self, iden: NodeId) -> Vec<(String, Value)>;

    /// Outbound light edges for a node, optionally filtered by verb.
    async fn get_node_edges(&self, iden: NodeId, verb: Option<&str>) -> Vec<(String, NodeId)>;

    /// Idens of every node with a stored representation in this layer.
    async fn stored_node_idens(&self) -> Vec<NodeId>;

    /// Apply per-node edit batches.
    async fn stor_node_edits(&self, edits: Vec<NodeEdits>, meta: &EditMeta) -> StrataResult<()>;
}

#[derive(Default)]
struct MemState {
    sodes: HashMap<NodeId, StoredNode>,
    nodedata: HashMap<NodeId, BTreeMap<String, Value>>,
    edges: HashMap<NodeId, BTreeSet<(String, NodeId)>>,
    batches_applied: usize,
}

/// In-memory layer backend used by tests and embedded hosts.
pub struct MemLayer {
    iden: String,
    state: Mutex<MemState>,
}

impl MemLayer {
    /// Create an empty layer.
    pub fn new(iden: impl Into<String>) -> Self {
        Self {
            iden: iden.into(),
            state: Mutex::new(MemState::default()),
        }
    }

    /// Seed a stored node directly (test/setup path).
    pub fn put_stored_node(&self, iden: NodeId, sode: StoredNode) {
        self.state.lock().unwrap().sodes.insert(iden, sode);
    }

    /// Seed a node data blob directly (test/setup path).
    pub fn put_node_data(&self, iden: NodeId, name: impl Into<String>, valu: Value) {
        self.state
            .lock()
            .unwrap()
            .nodedata
            .entry(iden)
            .or_default()
            .insert(name.into(), valu);
    }

    /// Seed an outbound edge directly (test/setup path).
    pub fn put_edge(&self, iden: NodeId, verb: impl Into<String>, dest: NodeId) {
        self.state
            .lock()
            .unwrap()
            .edges
            .entry(iden)
            .or_default()
            .insert((verb.into(), dest));
    }

    /// Number of edit batches applied to this layer.
    pub fn batches_applied(&self) -> usize {
        self.state.lock().unwrap().batches_applied
    }

    fn apply_edit(state: &mut MemState, iden: NodeId, form: &str, edit: Edit) {
        let sode = state
            .sodes
            .entry(iden)
            .or_insert_with(|| StoredNode::new(form));
        match edit {
            Edit::NodeAdd { valu } => {
                sode.form = form.to_string();
                sode.valu = Some(valu);
            }
            Edit::NodeDel { .. } => {
                sode.valu = None;
            }
            Edit::PropSet { name, valu } => {
                sode.props.insert(name, valu);
            }
            Edit::PropDel { name, .. } => {
                sode.props.remove(&name);
            }
            Edit::TagSet { tag, valu } => {
                sode.tags.insert(tag, valu);
            }
            Edit::TagDel { tag } => {
                sode.tags.remove(&tag);
            }
            Edit::TagPropSet { tag, prop, valu } => {
                sode.tagprops.insert((tag, prop), valu);
            }
            Edit::TagPropDel { tag, prop } => {
                sode.tagprops.remove(&(tag, prop));
            }
            Edit::DataSet { name, valu } => {
                state.nodedata.entry(iden).or_default().insert(name, valu);
            }
            Edit::DataDel { name } => {
                if let Some(data) = state.nodedata.get_mut(&iden) {
                    data.remove(&name);
                }
            }
            Edit::EdgeAdd { verb, dest } => {
                state.edges.entry(iden).or_default().insert((verb, dest));
            }
            Edit::EdgeDel { verb, dest } => {
                if let Some(edges) = state.edges.get_mut(&iden) {
                    edges.remove(&(verb, dest));
                }
            }
        }
        if state.sodes.get(&iden).is_some_and(StoredNode::is_empty) {
            state.sodes.remove(&iden);
        }
    }
}

#[async_trait]
impl Layer for MemLayer {
    fn iden(&self) -> &str {
        &self.iden
    }

    async fn get_stored_node(&self, iden: NodeId) -> Option<StoredNode> {
        self.state.lock().unwrap().sodes.get(&iden).cloned()
    }

    async fn get_node_data(&self, iden: NodeId) -> Vec<(String, Value)> {
        self.state
            .lock()
            .unwrap()
            .nodedata
            .get(&iden)
            .map(|data| data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    async fn get_node_edges(&self, iden: NodeId, verb: Option<&str>) -> Vec<(String, NodeId)> {
        self.state
            .lock()
            .unwrap()
            .edges
            .get(&iden)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(v, _)| verb.map_or(true, |want| v == want))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn stored_node_idens(&self) -> Vec<NodeId> {
        let mut idens: Vec<NodeId> = self.state.lock().unwrap().sodes.keys().copied().collect();
        idens.sort_unstable();
        idens
    }

    async fn stor_node_edits(&self, edits: Vec<NodeEdits>, _meta: &EditMeta) -> StrataResult<()> {
        let mut state = self.state.lock().unwrap();
        state.batches_applied += 1;
        for batch in edits {
            for edit in batch.edits {
                Self::apply_edit(&mut state, batch.iden, &batch.form, edit);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> EditMeta {
        EditMeta {
            user: "root".to_string(),
            time: 0,
        }
    }

    #[tokio::test]
    async fn test_edit_application() {
        let layr = MemLayer::new("layr00");

        let edits = vec![NodeEdits {
            iden: 1,
            form: "inet:ipv4".to_string(),
            edits: vec![
                Edit::NodeAdd {
                    valu: Value::Int(16909060),
                },
                Edit::PropSet {
                    name: "asn".to_string(),
                    valu: Value::Int(42),
                },
                Edit::TagSet {
                    tag: "cno.mal".to_string(),
                    valu: Value::Null,
                },
            ],
        }];
        layr.stor_node_edits(edits, &meta()).await.unwrap();

        let sode = layr.get_stored_node(1).await.unwrap();
        assert_eq!(sode.valu, Some(Value::Int(16909060)));
        assert_eq!(sode.props.get("asn"), Some(&Value::Int(42)));
        assert!(sode.tags.contains_key("cno.mal"));
        assert_eq!(layr.batches_applied(), 1);
    }

    #[tokio::test]
    async fn test_subtractive_edits_empty_the_layer() {
        let layr = MemLayer::new("layr00");
        let mut sode = StoredNode::new("inet:ipv4");
        sode.valu = Some(Value::Int(1));
        sode.tags.insert("foo".to_string(), Value::Null);
        layr.put_stored_node(1, sode);

        let edits = vec![NodeEdits {
            iden: 1,
            form: "inet:ipv4".to_string(),
            edits: vec![
                Edit::NodeDel {
                    valu: Value::Int(1),
                },
                Edit::TagDel {
                    tag: "foo".to_string(),
                },
            ],
        }];
        layr.stor_node_edits(edits, &meta()).await.unwrap();

        assert!(layr.get_stored_node(1).await.is_none());
        assert!(layr.stored_node_idens().await.is_empty());
    }

    #[tokio::test]
    async fn test_node_data_and_edges() {
        let layr = MemLayer::new("layr00");
        layr.put_node_data(1, "score", Value::Int(7));
        layr.put_edge(1, "refs", 2);
        layr.put_edge(1, "seen", 3);

        assert_eq!(
            layr.get_node_data(1).await,
            vec![("score".to_string(), Value::Int(7))]
        );
        assert_eq!(
            layr.get_node_edges(1, Some("refs")).await,
            vec![("refs".to_string(), 2)]
        );
        assert_eq!(layr.get_node_edges(1, None).await.len(), 2);
    }
}
