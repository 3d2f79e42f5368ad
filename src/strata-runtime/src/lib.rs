//! The Strata query runtime.
//!
//! This crate drives compiled queries as streaming pipelines of
//! (node, path) tuples: runtimes own variable scopes and permissions,
//! snaps mediate node access over a view, pipeline commands transform
//! the stream, and daemons run queries under supervision.
//!
//! Query compilation and durable storage live behind the
//! [`crate::core::QueryCompiler`] and `strata_storage::Layer` seams;
//! this crate is the execution engine between them.

pub mod cmd;
pub mod core;
pub mod daemon;
pub mod parser;
pub mod runtime;
pub mod scope;
pub mod snap;
pub mod stream;
pub mod testing;

pub use crate::cmd::{
    BackgroundCmd, Cmd, HelpCmd, MergeCmd, ParallelCmd, PureCmd, TeeCmd, ViewExecCmd,
};
pub use crate::core::{now_millis, Connector, Core, Query, QueryCompiler, RemoteHandle};
pub use crate::daemon::{Daemon, DaemonInfo, DaemonLogEntry, DaemonManager, DaemonStatus};
pub use crate::parser::{ArgSpec, CmdOpts, Parser};
pub use crate::runtime::{QueryOpts, Runtime};
pub use crate::scope::{BuiltinKind, RuntVars, ScopeArena, ScopeId};
pub use crate::snap::{Snap, SnapEvent};
pub use crate::stream::{
    empty_stream, iter_stream, once_stream, pipeline_stream, vec_stream, NodePath, NodePathStream,
    PipeOut, PipelineStream,
};
