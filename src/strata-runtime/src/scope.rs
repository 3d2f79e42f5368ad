//! Variable scopes and runtime-safety classification.
//!
//! Scopes for a query tree live in a single arena shared by the root
//! runtime and every nested runtime it opens. Each scope records its
//! parent by index, which keeps look-up delegation explicit and avoids
//! back-references between runtimes.

use std::collections::HashMap;

use strata_core::{Namespace, Value};

// ============================================================================
// Builtin namespaces
// ============================================================================

/// Tags for the lazily constructed builtin namespaces.
///
/// A builtin is constructed on first reference and memoized into the
/// scope of the runtime that referenced it, bound to that runtime's iden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// The `$lib` namespace.
    Lib,
}

impl BuiltinKind {
    /// Every registered builtin.
    pub const ALL: &'static [BuiltinKind] = &[BuiltinKind::Lib];

    /// The variable name the builtin is reachable under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lib => "lib",
        }
    }

    /// Look up a builtin by variable name.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Construct the namespace instance for a runtime.
    pub fn construct(&self, runtime: u64) -> Value {
        Value::Namespace(Namespace::new(self.name(), runtime))
    }
}

// ============================================================================
// Scope arena
// ============================================================================

/// Handle to a scope within a [`ScopeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<ScopeId>,
    /// Function scopes delegate writes up-chain only for names that
    /// already exist somewhere above them.
    funcscope: bool,
}

/// Arena of variable scopes for one query tree.
///
/// Reads walk the parent chain unconditionally. Writes land locally
/// unless the name belongs to a parent scope, in which case they
/// delegate to the immediate parent and re-resolve there.
#[derive(Default)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a scope seeded with `vars`.
    pub fn alloc(
        &mut self,
        parent: Option<ScopeId>,
        funcscope: bool,
        vars: HashMap<String, Value>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            vars,
            parent,
            funcscope,
        });
        id
    }

    /// Get a variable from the scope itself, ignoring parents.
    pub fn get_local(&self, id: ScopeId, name: &str) -> Option<Value> {
        self.scopes[id.0].vars.get(name).cloned()
    }

    /// Get a variable by walking the parent chain, nearest scope first.
    ///
    /// Reads cross function-scope boundaries.
    pub fn get(&self, id: ScopeId, name: &str) -> Option<Value> {
        let mut cur = Some(id);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid.0];
            if let Some(valu) = scope.vars.get(name) {
                return Some(valu.clone());
            }
            cur = scope.parent;
        }
        None
    }

    /// Set a variable directly in the scope.
    pub fn set_local(&mut self, id: ScopeId, name: impl Into<String>, valu: Value) {
        self.scopes[id.0].vars.insert(name.into(), valu);
    }

    /// Set a variable, delegating to the owning parent scope when the
    /// name is not local.
    ///
    /// Builtin names always land locally. A non-function scope delegates
    /// any non-local name to its immediate parent; a function scope
    /// delegates only names that already exist somewhere up-chain.
    pub fn set(&mut self, id: ScopeId, name: &str, valu: Value) {
        if BuiltinKind::lookup(name).is_some() || self.scopes[id.0].vars.contains_key(name) {
            self.scopes[id.0].vars.insert(name.to_string(), valu);
            return;
        }
        match self.delegate(id, name) {
            Some(parent) => self.set(parent, name, valu),
            None => {
                self.scopes[id.0].vars.insert(name.to_string(), valu);
            }
        }
    }

    /// Remove a variable, delegating like [`ScopeArena::set`].
    pub fn pop(&mut self, id: ScopeId, name: &str) -> Option<Value> {
        if BuiltinKind::lookup(name).is_some() || self.scopes[id.0].vars.contains_key(name) {
            return self.scopes[id.0].vars.remove(name);
        }
        let parent = self.delegate(id, name)?;
        self.pop(parent, name)
    }

    fn delegate(&self, id: ScopeId, name: &str) -> Option<ScopeId> {
        let scope = &self.scopes[id.0];
        let parent = scope.parent?;
        if !scope.funcscope {
            return Some(parent);
        }
        let mut cur = Some(parent);
        while let Some(sid) = cur {
            if self.scopes[sid.0].vars.contains_key(name) {
                return Some(parent);
            }
            cur = self.scopes[sid.0].parent;
        }
        None
    }

    /// The scope's local variables.
    pub fn local_vars(&self, id: ScopeId) -> HashMap<String, Value> {
        self.scopes[id.0].vars.clone()
    }

    /// Flatten the full chain into one map, nearest scope winning.
    pub fn flatten(&self, id: ScopeId) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        let mut cur = Some(id);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid.0];
            for (name, valu) in &scope.vars {
                vars.entry(name.clone()).or_insert_with(|| valu.clone());
            }
            cur = scope.parent;
        }
        vars
    }
}

// ============================================================================
// Runtime-safety classification
// ============================================================================

/// Per-runtime record of which variable names are runtime-safe.
///
/// A name is runtime-safe when its value does not depend on the node
/// flowing through the pipeline. Classification is sticky: once a name
/// is recorded, later classifications never change it, so a single
/// not-runt-safe assignment taints the name for the whole query.
#[derive(Debug, Clone, Default)]
pub struct RuntVars {
    flags: HashMap<String, bool>,
}

impl RuntVars {
    /// Create an empty record with the per-record names pre-seeded as
    /// not runtime-safe.
    pub fn seeded() -> Self {
        let mut rv = Self::default();
        rv.flags.insert("node".to_string(), false);
        rv.flags.insert("path".to_string(), false);
        rv
    }

    /// Record a classification; the first classification of a name wins.
    pub fn mark(&mut self, name: impl Into<String>, runtsafe: bool) {
        self.flags.entry(name.into()).or_insert(runtsafe);
    }

    /// Force a classification, overriding any prior record.
    ///
    /// Used only while seeding initial vars and builtins, which are
    /// runtime-safe by construction.
    pub fn force(&mut self, name: impl Into<String>, runtsafe: bool) {
        self.flags.insert(name.into(), runtsafe);
    }

    /// Inherit classifications from a parent runtime.
    pub fn inherit(&mut self, parent: &RuntVars) {
        for (name, runtsafe) in &parent.flags {
            self.flags.insert(name.clone(), *runtsafe);
        }
    }

    /// True when the name is recorded as runtime-safe.
    pub fn is_runtsafe(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_walks_parent_chain() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, false, HashMap::from([("x".to_string(), Value::Int(1))]));
        let child = arena.alloc(Some(root), false, HashMap::new());

        assert_eq!(arena.get(child, "x"), Some(Value::Int(1)));
        assert_eq!(arena.get_local(child, "x"), None);
        assert_eq!(arena.get(child, "y"), None);
    }

    #[test]
    fn test_set_delegates_to_parent() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, false, HashMap::from([("x".to_string(), Value::Int(1))]));
        let child = arena.alloc(Some(root), false, HashMap::new());

        // non-local name delegates upward and lands in the root
        arena.set(child, "x", Value::Int(2));
        assert_eq!(arena.get_local(root, "x"), Some(Value::Int(2)));
        assert_eq!(arena.get_local(child, "x"), None);

        // local name stays local
        arena.set_local(child, "y", Value::Int(3));
        arena.set(child, "y", Value::Int(4));
        assert_eq!(arena.get_local(child, "y"), Some(Value::Int(4)));
        assert_eq!(arena.get_local(root, "y"), None);
    }

    #[test]
    fn test_funcscope_delegates_only_known_names() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, false, HashMap::from([("x".to_string(), Value::Int(1))]));
        let func = arena.alloc(Some(root), true, HashMap::new());

        // name exists up-chain: write reaches the root
        arena.set(func, "x", Value::Int(2));
        assert_eq!(arena.get_local(root, "x"), Some(Value::Int(2)));

        // unknown name stays inside the function scope
        arena.set(func, "y", Value::Int(3));
        assert_eq!(arena.get_local(func, "y"), Some(Value::Int(3)));
        assert_eq!(arena.get_local(root, "y"), None);
    }

    #[test]
    fn test_nested_funcscope_writes_through_grandparent() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, false, HashMap::from([("x".to_string(), Value::Int(1))]));
        let mid = arena.alloc(Some(root), false, HashMap::new());
        let func = arena.alloc(Some(mid), true, HashMap::new());

        arena.set(func, "x", Value::Int(9));
        assert_eq!(arena.get_local(root, "x"), Some(Value::Int(9)));
    }

    #[test]
    fn test_pop_delegates_like_set() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, false, HashMap::from([("x".to_string(), Value::Int(1))]));
        let child = arena.alloc(Some(root), false, HashMap::new());

        assert_eq!(arena.pop(child, "x"), Some(Value::Int(1)));
        assert_eq!(arena.get(root, "x"), None);
        assert_eq!(arena.pop(child, "x"), None);
    }

    #[test]
    fn test_builtin_names_always_local() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(
            None,
            false,
            HashMap::from([("lib".to_string(), BuiltinKind::Lib.construct(1))]),
        );
        let child = arena.alloc(Some(root), false, HashMap::new());

        arena.set(child, "lib", BuiltinKind::Lib.construct(2));
        assert_eq!(
            arena.get_local(child, "lib"),
            Some(BuiltinKind::Lib.construct(2))
        );
        assert_eq!(
            arena.get_local(root, "lib"),
            Some(BuiltinKind::Lib.construct(1))
        );
    }

    #[test]
    fn test_flatten_nearest_wins() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(
            None,
            false,
            HashMap::from([
                ("x".to_string(), Value::Int(1)),
                ("y".to_string(), Value::Int(2)),
            ]),
        );
        let child = arena.alloc(
            Some(root),
            false,
            HashMap::from([("x".to_string(), Value::Int(10))]),
        );

        let flat = arena.flatten(child);
        assert_eq!(flat.get("x"), Some(&Value::Int(10)));
        assert_eq!(flat.get("y"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_runtvars_first_classification_wins() {
        let mut rv = RuntVars::seeded();
        assert!(!rv.is_runtsafe("node"));
        assert!(!rv.is_runtsafe("path"));

        rv.mark("foo", false);
        rv.mark("foo", true);
        assert!(!rv.is_runtsafe("foo"));

        rv.mark("bar", true);
        rv.mark("bar", false);
        assert!(rv.is_runtsafe("bar"));

        // unknown names default to not runtime-safe
        assert!(!rv.is_runtsafe("baz"));
    }
}
