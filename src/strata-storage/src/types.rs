//! Edit vocabulary and stored node representations.

use std::collections::BTreeMap;

use strata_core::{NodeId, Value};

/// A single edit applied to one node within a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Set the node's primary value (creating the node in this layer).
    NodeAdd { valu: Value },
    /// Retract the node's primary value (removing it from this layer).
    NodeDel { valu: Value },
    /// Set a secondary property.
    PropSet { name: String, valu: Value },
    /// Retract a secondary property.
    PropDel { name: String, valu: Value },
    /// Set a tag.
    TagSet { tag: String, valu: Value },
    /// Retract a tag.
    TagDel { tag: String },
    /// Set a tag property.
    TagPropSet { tag: String, prop: String, valu: Value },
    /// Retract a tag property.
    TagPropDel { tag: String, prop: String },
    /// Set an opaque node data blob.
    DataSet { name: String, valu: Value },
    /// Retract an opaque node data blob.
    DataDel { name: String },
    /// Add an outbound light edge.
    EdgeAdd { verb: String, dest: NodeId },
    /// Retract an outbound light edge.
    EdgeDel { verb: String, dest: NodeId },
}

/// A batch of edits for a single node.
///
/// Batching per node is what preserves atomicity of one node's
/// reconciliation: a batch is handed to the layer in a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEdits {
    /// Target node.
    pub iden: NodeId,
    /// Node form name.
    pub form: String,
    /// Ordered edits.
    pub edits: Vec<Edit>,
}

/// Provenance metadata recorded with an edit batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EditMeta {
    /// Acting identity iden.
    pub user: String,
    /// Epoch millis; one node's add/sub batches share a timestamp.
    pub time: i64,
}

/// One layer's stored representation of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredNode {
    /// Node form name.
    pub form: String,
    /// Primary value, if stored in this layer.
    pub valu: Option<Value>,
    /// Secondary properties stored in this layer.
    pub props: BTreeMap<String, Value>,
    /// Tags stored in this layer.
    pub tags: BTreeMap<String, Value>,
    /// Tag properties stored in this layer, keyed by (tag, prop).
    pub tagprops: BTreeMap<(String, String), Value>,
}

impl StoredNode {
    /// Create an empty representation for a form.
    pub fn new(form: impl Into<String>) -> Self {
        Self {
            form: form.into(),
            ..Self::default()
        }
    }

    /// True when nothing is stored for the node in this layer.
    pub fn is_empty(&self) -> bool {
        self.valu.is_none()
            && self.props.is_empty()
            && self.tags.is_empty()
            && self.tagprops.is_empty()
    }
}
