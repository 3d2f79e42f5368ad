//! Fan a query out over a pool of workers.

use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use common_runtime::{pipe, JoinSet, SharedReceiver};
use futures::StreamExt;
use strata_core::{TypeModel, Value};
use tokio::sync::mpsc;

use crate::core::Query;
use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::Runtime;
use crate::stream::{pipeline_stream, NodePath, NodePathStream};

use super::Cmd;

enum WorkMsg {
    Item(NodePath),
    Done,
    Failed(StrataError),
}

/// Execute part of a query pipeline in parallel.
///
/// Each worker runs the query over a hard-isolated runtime; inbound
/// items are handed to exactly one worker, and worker outputs interleave
/// in completion order. Output ordering is not preserved across the
/// fan-out boundary.
pub struct ParallelCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl ParallelCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for ParallelCmd {
    fn name(&self) -> String {
        "parallel".to_string()
    }

    fn descr(&self) -> String {
        "Execute part of a query pipeline in parallel.".to_string()
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
            ArgSpec::new(&["--size"])
                .argtype("int")
                .default(Value::Int(8))
                .help("The number of parallel query pipelines to execute."),
        )?;
        pars.add_argument(
            ArgSpec::new(&["query"])
                .help("The query to execute in parallel.")
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
        let size = self
            .opts
            .get_int("size")
            .filter(|size| *size > 0)
            .ok_or_else(|| StrataError::bad_arg("Invalid --size for parallel"))?
            as usize;

        let text = self
            .opts
            .get_str("query")
            .ok_or_else(|| StrataError::bad_arg("parallel requires a query argument"))?
            .to_string();

        let query = runt.snap.core().get_query(&text)?;
        query.validate(&runt)?;

        let (in_tx, in_rx) = pipe::<Option<NodePath>>(size);
        let inq = SharedReceiver::new(in_rx);
        let (out_tx, mut out_rx) = pipe::<WorkMsg>(size);

        Ok(pipeline_stream(size, move |out| async move {
            // aborted with the set when the consumer drops the stream
            let mut tasks: JoinSet<()> = JoinSet::new();

            for _ in 0..size {
                let subr = runt.get_worker_runtime(query.clone());
                let inq = inq.clone();
                let out_tx = out_tx.clone();
                tasks.spawn(async move {
                    let mesg = match pipeline_worker(subr, inq, out_tx.clone()).await {
                        Ok(()) => WorkMsg::Done,
                        Err(err) => WorkMsg::Failed(err),
                    };
                    let _ = out_tx.send(mesg).await;
                });
            }

            // pump: hand each inbound item to exactly one worker, then
            // deliver one end-of-input sentinel per worker
            tasks.spawn(async move {
                while let Some(res) = input.next().await {
                    match res {
                        Ok(item) => {
                            if in_tx.send(Some(item)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = out_tx.send(WorkMsg::Failed(err)).await;
                            return;
                        }
                    }
                }
                for _ in 0..size {
                    if in_tx.send(None).await.is_err() {
                        return;
                    }
                }
            });

            let mut exited = 0;
            while let Some(mesg) = out_rx.recv().await {
                match mesg {
                    WorkMsg::Item(item) => out.feed(item).await?,
                    WorkMsg::Done => {
                        exited += 1;
                        if exited == size {
                            break;
                        }
                    }
                    WorkMsg::Failed(err) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                }
            }
            Ok(())
        }))
    }
}

/// One fan-out worker: run the query over items from the shared input
/// queue until the end-of-input sentinel arrives.
async fn pipeline_worker(
    runt: Arc<Runtime>,
    inq: SharedReceiver<Option<NodePath>>,
    out_tx: mpsc::Sender<WorkMsg>,
) -> StrataResult<()> {
    let input: NodePathStream = Box::pin(futures::stream::unfold(inq, |inq| async move {
        match inq.recv().await {
            Some(Some(item)) => Some((Ok(item), inq)),
            // sentinel or closed channel: this worker is done
            _ => None,
        }
    }));

    let mut out = runt.execute(Some(input)).await?;
    while let Some(res) = out.next().await {
        let item = res?;
        out_tx
            .send(WorkMsg::Item(item))
            .await
            .map_err(|_| StrataError::cancelled("downstream consumer went away"))?;
        common_runtime::yield_now().await;
    }
    Ok(())
}
