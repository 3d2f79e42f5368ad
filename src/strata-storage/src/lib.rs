//! Storage interfaces for the Strata query runtime.
//!
//! The runtime treats storage as an external collaborator behind the
//! [`Layer`] trait: pages, transactions, and indices live elsewhere. This
//! crate defines the edit vocabulary, the per-layer stored representation
//! of a node, the view (layer stack) abstraction, and an in-memory layer
//! backend for tests and embedded hosts.

pub mod layer;
pub mod types;
pub mod view;

pub use layer::{Layer, MemLayer};
pub use types::{Edit, EditMeta, NodeEdits, StoredNode};
pub use view::View;
