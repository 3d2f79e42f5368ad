//! Detach a query from the current pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use futures::StreamExt;
use strata_core::TypeModel;

use crate::core::Query;
use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::{QueryOpts, Runtime};
use crate::snap::Snap;
use crate::stream::{pipeline_stream, NodePathStream};

use super::Cmd;

/// Execute a query in a detached task.
///
/// Inbound nodes pass through untouched. Once the input is drained, the
/// query starts in its own runtime over a fresh snap, seeded with a
/// wire-safe copy of the caller's vars. The task outlives the calling
/// query and is torn down with the core; its failures are logged, never
/// raised into any pipeline.
pub struct BackgroundCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl BackgroundCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for BackgroundCmd {
    fn name(&self) -> String {
        "background".to_string()
    }

    fn descr(&self) -> String {
        "Execute a query pipeline as a background task.".to_string()
    }

    fn runtsafe(&self) -> bool {
        self.runtsafe
    }

    fn get_arg_parser(&self, model: Arc<dyn TypeModel>) -> StrataResult<Parser> {
        let mut pars = Parser::new(self.name(), self.descr(), model);
        pars.add_argument(
            ArgSpec::new(&["query"])
                .help("The query to execute in the background.")
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
        if !self.runtsafe {
            return Err(StrataError::runtime("The background query must be runtsafe."));
        }

        let text = self
            .opts
            .get_str("query")
            .ok_or_else(|| StrataError::bad_arg("background requires a query argument"))?
            .to_string();

        let query = runt.snap.core().get_query(&text)?;
        query.validate(&runt)?;

        let capacity = runt.snap.core().config().pipeline.stage_capacity;

        Ok(pipeline_stream(capacity, move |out| async move {
            while let Some(res) = input.next().await {
                out.feed(res?).await?;
            }

            // only wire-safe values survive detachment
            let vars: HashMap<_, _> = runt
                .flatten_vars()
                .into_iter()
                .filter(|(_, valu)| valu.is_wire_safe())
                .collect();

            let opts = QueryOpts::with_vars(vars);

            let core = runt.snap.core().clone();
            let user = runt.user.clone();
            let view = runt.snap.view.clone();

            core.clone().sched_background(async move {
                let snap = Snap::new(core, user, view);
                let runt = match Runtime::new(query, snap, opts) {
                    Ok(runt) => runt,
                    Err(err) => {
                        tracing::warn!(target: "strata::background", "background query failed to start: {err}");
                        return;
                    }
                };
                let mut out = match runt.execute(None).await {
                    Ok(out) => out,
                    Err(err) => {
                        if !err.is_cancelled() {
                            tracing::warn!(target: "strata::background", "background query failed: {err}");
                        }
                        return;
                    }
                };
                while let Some(res) = out.next().await {
                    if let Err(err) = res {
                        if !err.is_cancelled() {
                            tracing::warn!(target: "strata::background", "background query failed: {err}");
                        }
                        return;
                    }
                }
            });
            Ok(())
        }))
    }
}
