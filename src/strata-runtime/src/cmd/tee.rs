//! Duplicate the pipeline into several sub-queries.

use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use futures::StreamExt;
use strata_core::{ArgAction, Nargs, TypeModel, Value};

use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::Runtime;
use crate::stream::{once_stream, pipeline_stream, NodePathStream};

use super::Cmd;

/// Execute multiple queries on each inbound node.
///
/// The sub-runtimes share the calling runtime's scope chain, so variable
/// writes inside a tee branch are visible to the caller afterward. With
/// `--join`, each inbound node is re-emitted after its branch outputs.
pub struct TeeCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl TeeCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for TeeCmd {
    fn name(&self) -> String {
        "tee".to_string()
    }

    fn descr(&self) -> String {
        "Execute multiple queries on the inbound nodes.".to_string()
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
            ArgSpec::new(&["--join", "-j"])
                .action(ArgAction::StoreTrue)
                .default(Value::Bool(false))
                .help("Emit inbound nodes after the tee'd queries."),
        )?;
        pars.add_argument(
            ArgSpec::new(&["query"])
                .nargs(Nargs::Star)
                .help("The queries to execute on each inbound node."),
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
        let join = self.opts.get_bool("join");

        let texts: Vec<String> = self
            .opts
            .get("query")
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if texts.is_empty() {
            return Err(StrataError::runtime("Tee command must take a query as input."));
        }

        // the sub-runtimes are opened once and reused per inbound node
        let mut subrs = Vec::with_capacity(texts.len());
        for text in &texts {
            let query = runt.snap.core().get_query(text)?;
            subrs.push(runt.get_sub_runtime(query, None)?);
        }

        let runtsafe = self.runtsafe;
        let capacity = runt.snap.core().config().pipeline.stage_capacity;

        Ok(pipeline_stream(capacity, move |out| async move {
            let mut any = false;
            while let Some(res) = input.next().await {
                let item = res?;
                any = true;

                for subr in &subrs {
                    let mut sub = subr.execute(Some(once_stream(item.clone()))).await?;
                    while let Some(subres) = sub.next().await {
                        out.feed(subres?).await?;
                    }
                }

                if join {
                    out.feed(item).await?;
                }
            }

            // a runtsafe tee with no inbound nodes runs each query once
            if !any && runtsafe {
                for subr in &subrs {
                    let mut sub = subr.execute(None).await?;
                    while let Some(subres) = sub.next().await {
                        out.feed(subres?).await?;
                    }
                }
            }
            Ok(())
        }))
    }
}
