//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! Note that this is a strictly "in process" queue meant for closely-related
//! subtasks of a larger task. Each session gets its own queue, so the limit on
//! one session never starves another.
//!
//! Normally, you will want to use [`WorkQueue`] and [`WorkQueueHandle`], which
//! provide a simple interface for submitting work items and waiting for them to
//! finish.

use std::sync::Arc;

use futures::{
    FutureExt, SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    prelude::*,
};

/// Work items are processed by [`WorkItemProcessor`]s. They contain an input,
/// and a one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    /// The input to the work item.
    pub input: InputData,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<OutputData>>,
}

/// API shared by workers.
///
/// This is fairly bare bones; you'll probably want to use [`WorkQueue`] and
/// [`WorkQueueHandle`] in normal usage.
pub trait WorkItemProcessor {
    type InputData: 'static;
    type OutputData: 'static;

    /// Process a work item. The result will be sent to `item.tx`.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()>;

    /// Process an input and return a channel that will receive the output.
    async fn submit_input(
        &self,
        input: Self::InputData,
    ) -> Result<oneshot::Receiver<Result<Self::OutputData>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        self.submit_work_item(item).await?;
        Ok(rx)
    }

    /// Process an input and wait for the output.
    async fn process_blocking(&self, input: Self::InputData) -> Result<Self::OutputData> {
        let rx = self.submit_input(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// An async work function.
pub type WorkFn<InputData, OutputData> = Arc<
    dyn Fn(InputData) -> BoxedFuture<Result<OutputData>> + Send + Sync + 'static,
>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`] that implements
/// [`WorkItemProcessor`]. It can be cloned cheaply and passed around.
pub struct WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    /// Our sender.
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueueHandle<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Process a stream of inputs, returning a stream of futures that will
    /// yield outputs. Typically used with [`futures::StreamExt::buffered`] or
    /// [`futures::StreamExt::buffer_unordered`] to resolve the futures,
    /// yielding a stream of outputs.
    ///
    /// You can use pretty much whatever concurrency you find appropriate when
    /// calling `buffered` or `buffer_unordered`, but the underlying concurrency
    /// limit on the [`WorkQueue`] will still be enforced normally.
    pub fn process_stream(
        &self,
        input: BoxedStream<InputData>,
    ) -> BoxedStream<BoxedFuture<Result<OutputData>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move { handle.process_blocking(input).await }.boxed()
            })
            .boxed()
    }
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<InputData, OutputData> Clone for WorkQueueHandle<InputData, OutputData> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<InputData, OutputData> WorkItemProcessor for WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    type InputData = InputData;
    type OutputData = OutputData;

    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()> {
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// A [`WorkItemProcessor`] that maintains a queue of work items and processes
/// them in parallel.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed. The background worker exits once
/// the queue and every handle to it have been dropped.
pub struct WorkQueue<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueue<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one time,
    /// but no more than `concurrency_limit` work items will ever be running.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<InputData, OutputData>,
    ) -> Result<(Self, JoinWorker)> {
        if concurrency_limit == 0 {
            return Err(anyhow!("concurrency limit must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(
                concurrency_limit,
                |item: WorkItem<InputData, OutputData>| async {
                    let result = work_fn(item.input).await;
                    if let Err(_sent_value) = item.tx.send(result) {
                        debug!(
                            "failed to send work item result because receiver was dropped"
                        );
                    }
                },
            )
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<InputData, OutputData> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}
