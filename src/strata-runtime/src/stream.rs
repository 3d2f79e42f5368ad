//! Node-path stream utilities.
//!
//! This module provides the [`NodePathStream`] abstraction every pipeline
//! stage consumes and produces, plus the channel-backed producer used to
//! express stages as spawned tasks.

use std::pin::Pin;
use std::task::{Context, Poll};

use common_error::{StrataError, StrataResult};
use futures::stream::Stream;
use tokio::sync::mpsc;

use strata_core::{Node, Path};

/// One pipeline item: a node and its per-record variable path.
pub type NodePath = (Node, Path);

/// A stream of (node, path) tuples.
///
/// This is the primary data exchange type between pipeline stages. Within
/// a non-fan-out pipeline, output ordering strictly follows input
/// ordering.
pub type NodePathStream = Pin<Box<dyn Stream<Item = StrataResult<NodePath>> + Send>>;

/// Create an empty `NodePathStream`.
pub fn empty_stream() -> NodePathStream {
    Box::pin(futures::stream::empty())
}

/// Create a `NodePathStream` from a single item.
pub fn once_stream(item: NodePath) -> NodePathStream {
    Box::pin(futures::stream::once(async move { Ok(item) }))
}

/// Create a `NodePathStream` from a vector of items.
pub fn vec_stream(items: Vec<NodePath>) -> NodePathStream {
    Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
}

/// Create a `NodePathStream` from a fallible iterator.
pub fn iter_stream<I>(iter: I) -> NodePathStream
where
    I: IntoIterator<Item = StrataResult<NodePath>> + Send + 'static,
    I::IntoIter: Send,
{
    Box::pin(futures::stream::iter(iter))
}

// ============================================================================
// Pipeline producer
// ============================================================================

/// Sending half handed to a pipeline stage body.
///
/// `feed` suspends on backpressure and yields to the scheduler after every
/// item, so a stage can never starve other tasks sharing the loop.
#[derive(Clone)]
pub struct PipeOut {
    tx: mpsc::Sender<StrataResult<NodePath>>,
}

impl PipeOut {
    /// Forward one item downstream.
    ///
    /// Fails with `Cancelled` once the consumer dropped the stream, which
    /// unwinds the producing stage.
    pub async fn feed(&self, item: NodePath) -> StrataResult<()> {
        self.tx
            .send(Ok(item))
            .await
            .map_err(|_| StrataError::cancelled("downstream consumer went away"))?;
        common_runtime::yield_now().await;
        Ok(())
    }
}

/// A channel-backed stream driven by a spawned producer task.
///
/// Dropping the stream aborts the producer, which is how cancellation
/// propagates into the tasks a pipeline stage spawned.
pub struct PipelineStream {
    rx: mpsc::Receiver<StrataResult<NodePath>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Stream for PipelineStream {
    type Item = StrataResult<NodePath>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PipelineStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run a stage body as a task producing a `NodePathStream`.
///
/// The body receives a [`PipeOut`]; returning an error forwards it
/// downstream, where the consumer re-raises it.
pub fn pipeline_stream<F, Fut>(capacity: usize, func: F) -> NodePathStream
where
    F: FnOnce(PipeOut) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StrataResult<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let out = PipeOut { tx: tx.clone() };

    let handle = common_runtime::spawn(async move {
        if let Err(err) = func(out).await {
            let _ = tx.send(Err(err)).await;
        }
    });

    Box::pin(PipelineStream { rx, handle })
}
