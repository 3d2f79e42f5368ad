//! Pipeline commands.
//!
//! A command is one stage of a query pipeline: it parses its argv once,
//! then transforms the node-path stream flowing through it. A command
//! instance is bound to a single invocation and never reused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use futures::StreamExt;
use strata_core::{CmdDef, Nargs, TypeModel, Value};

use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::Runtime;
use crate::stream::{pipeline_stream, NodePathStream};

pub mod background;
pub mod merge;
pub mod parallel;
pub mod tee;
pub mod viewexec;

pub use background::BackgroundCmd;
pub use merge::MergeCmd;
pub use parallel::ParallelCmd;
pub use tee::TeeCmd;
pub use viewexec::ViewExecCmd;

/// A pipeline command.
#[async_trait]
pub trait Cmd: Send + Sync {
    /// Command name as spelled in query text.
    fn name(&self) -> String;

    /// One-line description for help output.
    fn descr(&self) -> String {
        String::new()
    }

    /// True when the command body runs with elevated privileges.
    fn asroot(&self) -> bool {
        false
    }

    /// True when the command never writes.
    fn is_readonly(&self) -> bool {
        false
    }

    /// Whether the command's argv was runtime-safe at compile time.
    fn runtsafe(&self) -> bool;

    /// Build the argument parser for this command.
    fn get_arg_parser(&self, model: Arc<dyn TypeModel>) -> StrataResult<Parser>;

    /// Store the parsed options.
    fn set_opts(&mut self, opts: CmdOpts);

    /// Parse argv, storing the options on success.
    ///
    /// Returns `Ok(false)` when the parser entered the help state; the
    /// accumulated messages have already been printed and the command
    /// must not execute.
    fn set_argv(&mut self, runt: &Runtime, argv: &[Value]) -> StrataResult<bool> {
        let model = runt.snap.core().model();
        let mut pars = self.get_arg_parser(model)?;
        let opts = pars.parse_args(argv);
        for mesg in &pars.mesgs {
            runt.printf(mesg.clone());
        }
        match opts {
            Some(opts) => {
                self.set_opts(opts);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute the command over the input stream.
    async fn exec(&self, runt: Arc<Runtime>, input: NodePathStream)
        -> StrataResult<NodePathStream>;
}

// ============================================================================
// Declarative commands
// ============================================================================

/// A command defined by a [`CmdDef`] rather than native code.
///
/// The definition's query body runs in an isolated command runtime with
/// `$cmdopts` and `$cmdconf` seeded, and each path gets a fresh variable
/// frame for the duration of the invocation.
pub struct PureCmd {
    cdef: CmdDef,
    runtsafe: bool,
    opts: CmdOpts,
}

impl PureCmd {
    pub fn new(cdef: CmdDef, runtsafe: bool) -> Self {
        Self {
            cdef,
            runtsafe,
            opts: CmdOpts::default(),
        }
    }

    fn asroot_perm(&self) -> Vec<String> {
        let mut perm = vec!["cmd".to_string(), "asroot".to_string()];
        perm.extend(self.cdef.name.split('.').map(str::to_string));
        perm
    }
}

#[async_trait]
impl Cmd for PureCmd {
    fn name(&self) -> String {
        self.cdef.name.clone()
    }

    fn descr(&self) -> String {
        self.cdef.descr.clone().unwrap_or_default()
    }

    fn asroot(&self) -> bool {
        self.cdef.asroot
    }

    fn is_readonly(&self) -> bool {
        true
    }

    fn runtsafe(&self) -> bool {
        self.runtsafe
    }

    fn get_arg_parser(&self, model: Arc<dyn TypeModel>) -> StrataResult<Parser> {
        let mut pars = Parser::new(self.cdef.name.clone(), self.descr(), model);
        for def in &self.cdef.cmdargs {
            pars.add_argument(ArgSpec::from_def(def))?;
        }
        Ok(pars)
    }

    fn set_opts(&mut self, opts: CmdOpts) {
        self.opts = opts;
    }

    async fn exec(
        &self,
        runt: Arc<Runtime>,
        input: NodePathStream,
    ) -> StrataResult<NodePathStream> {
        let perm = self.asroot_perm();
        let permrefs: Vec<&str> = perm.iter().map(String::as_str).collect();
        let asroot = runt.allowed(&permrefs, None);
        if self.cdef.asroot && !asroot {
            let mesg = format!(
                "Command ({}) elevates privileges.  You need permission: {}",
                self.cdef.name,
                perm.join("."),
            );
            return Err(StrataError::auth_deny(mesg, &permrefs));
        }

        let query = runt.snap.core().get_query(&self.cdef.storm)?;

        let cmdopts = self.opts.to_value();
        let cmdconf = Value::Map(self.cdef.cmdconf.clone());

        let mut vars = HashMap::new();
        vars.insert("cmdopts".to_string(), cmdopts.clone());
        vars.insert("cmdconf".to_string(), cmdconf);

        let subr = runt.get_cmd_runtime(query, vars);
        subr.set_asroot(asroot);

        // frame the incoming paths so the body sees only $cmdopts
        let framed: NodePathStream = Box::pin(input.map(move |res| {
            res.map(|(node, mut path)| {
                path.init_frame(HashMap::from([("cmdopts".to_string(), cmdopts.clone())]));
                (node, path)
            })
        }));

        let out = subr.execute(Some(framed)).await?;

        Ok(Box::pin(out.map(|res| {
            res.map(|(node, mut path)| {
                path.fini_frame();
                (node, path)
            })
        })))
    }
}

// ============================================================================
// help
// ============================================================================

/// List the loaded commands.
pub struct HelpCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl HelpCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for HelpCmd {
    fn name(&self) -> String {
        "help".to_string()
    }

    fn descr(&self) -> String {
        "List available commands and a brief description for each.".to_string()
    }

    fn is_readonly(&self) -> bool {
        true
    }

    fn runtsafe(&self) -> bool {
        self.runtsafe
    }

    fn get_arg_parser(&self, model: Arc<dyn TypeModel>) -> StrataResult<Parser> {
        let mut pars = Parser::new(self.name(), self.descr(), model);
        pars.add_argument(
            ArgSpec::new(&["command"])
                .nargs(Nargs::Opt)
                .help("Only list commands and their brief starting with the given string."),
        )?;
        Ok(pars)
    }

    fn set_opts(&mut self, opts: CmdOpts) {
        self.opts = opts;
    }

    async fn exec(
        &self,
        runt: Arc<Runtime>,
        mut input: NodePathStream,
    ) -> StrataResult<NodePathStream> {
        let prefix = self
            .opts
            .get_str("command")
            .map(str::to_string)
            .unwrap_or_default();
        let capacity = runt.snap.core().config().pipeline.stage_capacity;

        Ok(pipeline_stream(capacity, move |out| async move {
            while let Some(res) = input.next().await {
                out.feed(res?).await?;
            }

            let mut names = Vec::new();
            for cdef in runt.snap.core().cmd_defs() {
                if !cdef.name.starts_with(&prefix) {
                    continue;
                }
                names.push((cdef.name.clone(), cdef.descr.unwrap_or_default()));
            }

            if names.is_empty() && !prefix.is_empty() {
                runt.printf(format!("No commands found matching \"{prefix}\""));
                return Ok(());
            }

            let width = names.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
            for (name, descr) in names {
                runt.printf(format!("{name:width$} : {descr}"));
            }
            runt.printf(String::new());
            runt.printf("For detailed help on any command, use <cmd> --help");
            Ok(())
        }))
    }
}
