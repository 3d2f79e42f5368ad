//! Core data types for the Strata query runtime.
//!
//! This crate holds the vocabulary shared by the storage and runtime
//! layers: runtime values, materialized nodes and their per-record paths,
//! acting identities with permission rules, the type-normalization seam,
//! and the command/daemon definition records consumed from the package
//! system.

pub mod auth;
pub mod defs;
pub mod model;
pub mod node;
pub mod value;

pub use auth::{Identity, Rule};
pub use defs::{ArgAction, CmdArgDef, CmdDef, DaemonDef, DaemonOpts, Nargs};
pub use model::{BaseModel, TypeModel};
pub use node::{Node, NodeId, Path};
pub use value::{Namespace, Value};
