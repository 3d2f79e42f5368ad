//! Run a query inside another view.

use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use futures::StreamExt;
use strata_core::TypeModel;

use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::{QueryOpts, Runtime};
use crate::stream::{pipeline_stream, NodePathStream};

use super::Cmd;

/// Execute a query against a different view.
///
/// For each inbound node, the query runs to completion inside the target
/// view with the node's path vars seeded; its outputs are discarded and
/// the inbound node is re-emitted. Crossing the view boundary requires
/// `view.read` on the target, checked when the nested runtime opens.
pub struct ViewExecCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl ViewExecCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for ViewExecCmd {
    fn name(&self) -> String {
        "view.exec".to_string()
    }

    fn descr(&self) -> String {
        "Execute a query in a different view.".to_string()
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
            ArgSpec::new(&["view"])
                .help("The iden of the view in which the query will execute.")
                .required(),
        )?;
        pars.add_argument(
            ArgSpec::new(&["storm"])
                .help("The query to execute on the view.")
                .required(),
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
        let viewiden = self
            .opts
            .get_str("view")
            .ok_or_else(|| StrataError::bad_arg("view.exec requires a view argument"))?
            .to_string();
        let text = self
            .opts
            .get_str("storm")
            .ok_or_else(|| StrataError::bad_arg("view.exec requires a storm argument"))?
            .to_string();

        let query = runt.snap.core().get_query(&text)?;

        let runtsafe = self.runtsafe;
        let capacity = runt.snap.core().config().pipeline.stage_capacity;

        Ok(pipeline_stream(capacity, move |out| async move {
            let mut any = false;

            while let Some(res) = input.next().await {
                let item = res?;
                any = true;

                let opts = QueryOpts {
                    view: Some(viewiden.clone()),
                    vars: item.1.vars().clone(),
                    ..QueryOpts::default()
                };

                let subr = runt.get_sub_runtime(query.clone(), Some(opts))?;
                let mut sub = subr.execute(None).await?;
                while let Some(subres) = sub.next().await {
                    // the nested query's output never enters this pipeline
                    let _ = subres?;
                    common_runtime::yield_now().await;
                }

                out.feed(item).await?;
            }

            // a runtsafe view.exec with no inbound nodes runs once
            if !any && runtsafe {
                let opts = QueryOpts {
                    view: Some(viewiden.clone()),
                    ..QueryOpts::default()
                };
                let subr = runt.get_sub_runtime(query.clone(), Some(opts))?;
                let mut sub = subr.execute(None).await?;
                while let Some(subres) = sub.next().await {
                    let _ = subres?;
                    common_runtime::yield_now().await;
                }
            }
            Ok(())
        }))
    }
}
