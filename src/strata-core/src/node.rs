//! Materialized nodes and the per-record variable path.

use std::collections::HashMap;

use crate::value::Value;

/// Node identifier.
pub type NodeId = u64;

/// A materialized node flowing through a pipeline.
///
/// The stored representation of a node may be split across the layers of a
/// view; a `Node` is the merged, read-side picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node identifier.
    pub iden: NodeId,
    /// Form (type) name, e.g. `inet:ipv4`.
    pub form: String,
    /// Primary value.
    pub valu: Value,
    /// Secondary properties.
    pub props: HashMap<String, Value>,
    /// Tags with their (possibly null) interval values.
    pub tags: HashMap<String, Value>,
    /// Tag properties keyed by (tag, prop).
    pub tagprops: HashMap<(String, String), Value>,
}

impl Node {
    /// Create a bare node with a form and primary value.
    pub fn new(iden: NodeId, form: impl Into<String>, valu: Value) -> Self {
        Self {
            iden,
            form: form.into(),
            valu,
            props: HashMap::new(),
            tags: HashMap::new(),
            tagprops: HashMap::new(),
        }
    }

    /// Set a secondary property.
    pub fn with_prop(mut self, name: impl Into<String>, valu: Value) -> Self {
        self.props.insert(name.into(), valu);
        self
    }

    /// Set a tag.
    pub fn with_tag(mut self, tag: impl Into<String>, valu: Value) -> Self {
        self.tags.insert(tag.into(), valu);
        self
    }

    /// Full property name used in permission paths, `<form>:<prop>`.
    pub fn full_prop(&self, name: &str) -> String {
        format!("{}:{}", self.form, name)
    }
}

/// Per-record variable state travelling with a node.
///
/// A path carries the variables visible to the record plus the lineage of
/// node idens it passed through. Frames isolate the variable view inside a
/// pure command invocation: `init_frame` pushes a fresh variable map and
/// `fini_frame` restores the caller's view.
#[derive(Debug, Clone, Default)]
pub struct Path {
    /// Node iden lineage, oldest first.
    pub nodes: Vec<NodeId>,
    frames: Vec<HashMap<String, Value>>,
}

impl Path {
    /// Create a path seeded with the runtime's variables and a node.
    pub fn new(vars: HashMap<String, Value>, node: NodeId) -> Self {
        Self {
            nodes: vec![node],
            frames: vec![vars],
        }
    }

    /// Extend the lineage with a newly produced node.
    pub fn fork(&self, node: NodeId) -> Self {
        let mut path = self.clone();
        path.nodes.push(node);
        path
    }

    /// Variables visible in the active frame.
    pub fn vars(&self) -> &HashMap<String, Value> {
        self.frames.last().expect("path always has a frame")
    }

    /// Get a variable from the active frame.
    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.vars().get(name)
    }

    /// Set a variable in the active frame.
    pub fn set_var(&mut self, name: impl Into<String>, valu: Value) {
        self.frames
            .last_mut()
            .expect("path always has a frame")
            .insert(name.into(), valu);
    }

    /// Push a fresh variable frame seeded with `initvars`.
    pub fn init_frame(&mut self, initvars: HashMap<String, Value>) {
        self.frames.push(initvars);
    }

    /// Pop the most recent frame, restoring the caller's variable view.
    ///
    /// The base frame is never popped.
    pub fn fini_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_vars() {
        let mut path = Path::new(HashMap::from([("x".to_string(), Value::Int(1))]), 10);
        assert_eq!(path.get_var("x"), Some(&Value::Int(1)));

        path.set_var("y", Value::Int(2));
        assert_eq!(path.get_var("y"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_path_frames() {
        let mut path = Path::new(HashMap::from([("x".to_string(), Value::Int(1))]), 10);

        path.init_frame(HashMap::from([("cmdopts".to_string(), Value::Null)]));
        assert!(path.get_var("x").is_none());
        assert_eq!(path.get_var("cmdopts"), Some(&Value::Null));

        path.fini_frame();
        assert_eq!(path.get_var("x"), Some(&Value::Int(1)));

        // base frame survives a stray fini
        path.fini_frame();
        assert_eq!(path.get_var("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_path_fork() {
        let path = Path::new(HashMap::new(), 1);
        let next = path.fork(2);
        assert_eq!(next.nodes, vec![1, 2]);
        assert_eq!(path.nodes, vec![1]);
    }

    #[test]
    fn test_full_prop() {
        let node = Node::new(1, "inet:fqdn", Value::Str("vertex.link".into()));
        assert_eq!(node.full_prop("zone"), "inet:fqdn:zone");
    }
}
