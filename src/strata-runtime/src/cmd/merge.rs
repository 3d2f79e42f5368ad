//! Merge fork deltas down into the parent view.

use std::sync::Arc;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use futures::StreamExt;
use strata_core::{ArgAction, Node, Path, TypeModel, Value};
use strata_storage::{Edit, EditMeta, Layer, NodeEdits, StoredNode};

use crate::core::now_millis;
use crate::parser::{ArgSpec, CmdOpts, Parser};
use crate::runtime::Runtime;
use crate::stream::{pipeline_stream, PipeOut, NodePathStream};

use super::Cmd;

/// Merge edits from a forked view into its parent.
///
/// Without `--apply` the command previews: each would-be change prints
/// one line and nothing is written. With `--apply`, additive edits land
/// in the parent's write layer and the matching subtractive edits erase
/// the fork's deltas, per node, so an interrupted merge never splits an
/// individual node's edits.
pub struct MergeCmd {
    runtsafe: bool,
    opts: CmdOpts,
}

impl MergeCmd {
    pub fn new(runtsafe: bool) -> Self {
        Self {
            runtsafe,
            opts: CmdOpts::default(),
        }
    }
}

#[async_trait]
impl Cmd for MergeCmd {
    fn name(&self) -> String {
        "merge".to_string()
    }

    fn descr(&self) -> String {
        "Merge edits from a forked view into its parent.".to_string()
    }

    fn runtsafe(&self) -> bool {
        self.runtsafe
    }

    fn get_arg_parser(&self, model: Arc<dyn TypeModel>) -> StrataResult<Parser> {
        let mut pars = Parser::new(self.name(), self.descr(), model);
        pars.add_argument(
            ArgSpec::new(&["--apply"])
                .action(ArgAction::StoreTrue)
                .default(Value::Bool(false))
                .help("Execute the merge changes."),
        )?;
        pars.add_argument(
            ArgSpec::new(&["--diff"])
                .action(ArgAction::StoreTrue)
                .default(Value::Bool(false))
                .help("Enumerate all changes in the current view."),
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
        let view = runt.snap.view.clone();
        if !view.is_fork() {
            return Err(StrataError::CantMergeView(
                "You may only merge nodes in forked views".to_string(),
            ));
        }

        let apply = self.opts.get_bool("apply");
        let diff = self.opts.get_bool("diff");

        if apply {
            runt.confirm_mutable()?;
        }

        let config = runt.snap.core().config().pipeline.clone();

        let merger = Merger {
            runt: runt.clone(),
            layr_top: view.layers[0].clone(),
            layr_base: view.layers[1].clone(),
            apply,
            batch: config.merge_batch_size,
        };

        Ok(pipeline_stream(config.stage_capacity, move |out| async move {
            if diff {
                // inbound nodes pass through untouched; the fork's own
                // deltas are enumerated and merged afterward
                while let Some(res) = input.next().await {
                    out.feed(res?).await?;
                }
                for iden in merger.layr_top.stored_node_idens().await {
                    let Some(node) = merger.runt.snap.get_node(iden).await else {
                        continue;
                    };
                    let path = merger.runt.init_path(&node);
                    merger.merge_node(node, path, &out).await?;
                }
                return Ok(());
            }

            while let Some(res) = input.next().await {
                let (node, path) = res?;
                merger.merge_node(node, path, &out).await?;
            }
            Ok(())
        }))
    }
}

struct Merger {
    runt: Arc<Runtime>,
    layr_top: Arc<dyn Layer>,
    layr_base: Arc<dyn Layer>,
    apply: bool,
    batch: usize,
}

impl Merger {
    /// Merge one node's deltas, re-emitting the post-merge node.
    async fn merge_node(&self, node: Node, path: Path, out: &PipeOut) -> StrataResult<()> {
        let iden = node.iden;
        let form = node.form.clone();
        let nodeiden = format!("{iden:016x}");

        let gate_top = self.layr_top.iden().to_string();
        let gate_base = self.layr_base.iden().to_string();

        // each node's edits carry their own creation time
        let meta = EditMeta {
            user: self.runt.user.iden.clone(),
            time: now_millis(),
        };

        let sode = self
            .layr_top
            .get_stored_node(iden)
            .await
            .unwrap_or_else(|| StoredNode::new(&form));

        let mut adds: Vec<Edit> = Vec::new();
        let mut subs: Vec<Edit> = Vec::new();

        if let Some(valu) = sode.valu.clone() {
            self.runt.confirm(&["node", "del", &form], Some(&gate_top))?;
            self.runt.confirm(&["node", "add", &form], Some(&gate_base))?;
            if self.apply {
                adds.push(Edit::NodeAdd { valu: valu.clone() });
                subs.push(Edit::NodeDel { valu });
            } else {
                self.runt.printf(format!("{nodeiden} {form} = {valu}"));
            }
        }

        for (name, valu) in &sode.props {
            let full = format!("{form}:{name}");
            self.runt
                .confirm(&["node", "prop", "del", &full], Some(&gate_top))?;
            self.runt
                .confirm(&["node", "prop", "set", &full], Some(&gate_base))?;
            if self.apply {
                adds.push(Edit::PropSet {
                    name: name.clone(),
                    valu: valu.clone(),
                });
                subs.push(Edit::PropDel {
                    name: name.clone(),
                    valu: valu.clone(),
                });
            } else {
                self.runt.printf(format!("{nodeiden} {full} = {valu}"));
            }
        }

        for (tag, valu) in &sode.tags {
            self.confirm_tag_perms(tag, &gate_top, &gate_base)?;
            if self.apply {
                adds.push(Edit::TagSet {
                    tag: tag.clone(),
                    valu: valu.clone(),
                });
                subs.push(Edit::TagDel { tag: tag.clone() });
            } else if valu.is_null() {
                self.runt.printf(format!("{nodeiden} {form}#{tag}"));
            } else {
                self.runt.printf(format!("{nodeiden} {form}#{tag} = {valu}"));
            }
        }

        for ((tag, prop), valu) in &sode.tagprops {
            self.confirm_tag_perms(tag, &gate_top, &gate_base)?;
            if self.apply {
                adds.push(Edit::TagPropSet {
                    tag: tag.clone(),
                    prop: prop.clone(),
                    valu: valu.clone(),
                });
                subs.push(Edit::TagPropDel {
                    tag: tag.clone(),
                    prop: prop.clone(),
                });
            } else {
                self.runt
                    .printf(format!("{nodeiden} {form}#{tag}:{prop} = {valu}"));
            }
        }

        for (name, valu) in self.layr_top.get_node_data(iden).await {
            self.runt
                .confirm(&["node", "data", "pop", &name], Some(&gate_top))?;
            self.runt
                .confirm(&["node", "data", "set", &name], Some(&gate_base))?;
            if self.apply {
                adds.push(Edit::DataSet {
                    name: name.clone(),
                    valu,
                });
                subs.push(Edit::DataDel { name });
            } else {
                self.runt
                    .printf(format!("{nodeiden} {form} DATA {name} = {valu}"));
            }
            if adds.len() >= self.batch {
                self.flush(iden, &form, &mut adds, &mut subs, &meta).await?;
            }
        }

        for (verb, dest) in self.layr_top.get_node_edges(iden, None).await {
            self.runt
                .confirm(&["node", "edge", "del", &verb], Some(&gate_top))?;
            self.runt
                .confirm(&["node", "edge", "add", &verb], Some(&gate_base))?;
            if self.apply {
                adds.push(Edit::EdgeAdd {
                    verb: verb.clone(),
                    dest,
                });
                subs.push(Edit::EdgeDel { verb, dest });
            } else {
                self.runt
                    .printf(format!("{nodeiden} {form} +({verb})> {dest:016x}"));
            }
            if adds.len() >= self.batch {
                self.flush(iden, &form, &mut adds, &mut subs, &meta).await?;
            }
        }

        self.flush(iden, &form, &mut adds, &mut subs, &meta).await?;

        // the next read must observe the post-merge picture
        self.runt.snap.clear_cached(iden);
        match self.runt.snap.get_node(iden).await {
            Some(fresh) => out.feed((fresh, path)).await?,
            None => out.feed((node, path)).await?,
        }
        Ok(())
    }

    fn confirm_tag_perms(&self, tag: &str, gate_top: &str, gate_base: &str) -> StrataResult<()> {
        let parts: Vec<&str> = tag.split('.').collect();
        let mut del = vec!["node", "tag", "del"];
        del.extend(&parts);
        self.runt.confirm(&del, Some(gate_top))?;
        let mut add = vec!["node", "tag", "add"];
        add.extend(&parts);
        self.runt.confirm(&add, Some(gate_base))
    }

    /// Apply pending edits: adds to the parent's write layer, then the
    /// matching subtractions to the fork's top layer.
    async fn flush(
        &self,
        iden: strata_core::NodeId,
        form: &str,
        adds: &mut Vec<Edit>,
        subs: &mut Vec<Edit>,
        meta: &EditMeta,
    ) -> StrataResult<()> {
        if !self.apply {
            adds.clear();
            subs.clear();
            return Ok(());
        }
        if !adds.is_empty() {
            let edits = vec![NodeEdits {
                iden,
                form: form.to_string(),
                edits: std::mem::take(adds),
            }];
            self.layr_base.stor_node_edits(edits, meta).await?;
        }
        if !subs.is_empty() {
            let edits = vec![NodeEdits {
                iden,
                form: form.to_string(),
                edits: std::mem::take(subs),
            }];
            self.layr_top.stor_node_edits(edits, meta).await?;
        }
        Ok(())
    }
}
