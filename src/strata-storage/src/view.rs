//! Views: named, possibly forked layer stacks.

use std::sync::Arc;

use strata_core::{Node, NodeId};

use crate::layer::Layer;

/// A named logical dataset composed of one or more stacked layers.
///
/// Layers are ordered top-first: `layers[0]` is the write layer. A fork's
/// top layer holds only its own deltas over the parent view's stack.
pub struct View {
    /// Stable view iden; also the auth gate for view-scoped permissions.
    pub iden: String,
    /// Parent view iden when this view is a fork.
    pub parent: Option<String>,
    /// Layer stack, top-first.
    pub layers: Vec<Arc<dyn Layer>>,
}

impl View {
    /// Create a standalone (non-forked) view.
    pub fn new(iden: impl Into<String>, layers: Vec<Arc<dyn Layer>>) -> Self {
        Self {
            iden: iden.into(),
            parent: None,
            layers,
        }
    }

    /// Create a fork of `parent` with `top` stacked over its layers.
    pub fn fork(iden: impl Into<String>, parent: &View, top: Arc<dyn Layer>) -> Self {
        let mut layers = vec![top];
        layers.extend(parent.layers.iter().cloned());
        Self {
            iden: iden.into(),
            parent: Some(parent.iden.clone()),
            layers,
        }
    }

    /// True when this view is a fork of another view.
    pub fn is_fork(&self) -> bool {
        self.parent.is_some()
    }

    /// The write layer.
    pub fn top_layer(&self) -> &Arc<dyn Layer> {
        &self.layers[0]
    }

    /// Materialize the merged read-side picture of a node.
    ///
    /// Layers are folded bottom-up so upper layers override lower ones.
    pub async fn get_node(&self, iden: NodeId) -> Option<Node> {
        let mut node: Option<Node> = None;

        for layr in self.layers.iter().rev() {
            let Some(sode) = layr.get_stored_node(iden).await else {
                continue;
            };

            let merged = node.get_or_insert_with(|| Node::new(iden, sode.form.clone(), strata_core::Value::Null));
            if let Some(valu) = sode.valu {
                merged.form = sode.form.clone();
                merged.valu = valu;
            }
            for (name, valu) in sode.props {
                merged.props.insert(name, valu);
            }
            for (tag, valu) in sode.tags {
                merged.tags.insert(tag, valu);
            }
            for (key, valu) in sode.tagprops {
                merged.tagprops.insert(key, valu);
            }
        }

        node
    }
}
