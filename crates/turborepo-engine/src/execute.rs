use std::sync::{Arc, Mutex};

use futures::{StreamExt, stream::FuturesUnordered};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::debug;
use turborepo_graph_utils::Walker;
use turborepo_task_id::TaskId;

use crate::{Engine, TaskNode};

/// A task handed to the visitor, with the channel it answers on.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

/// The visitor's way of saying "schedule nothing further". Tasks already
/// running are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub parallel: bool,
    pub concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<TaskId<'static>, Result<(), StopExecution>>>>
    for ExecuteError
{
    fn from(
        _: mpsc::error::SendError<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Self {
        ExecuteError::Visitor
    }
}

impl Engine {
    /// Walks the graph, sending each ready task to the visitor channel
    /// while at most `concurrency` tasks hold permits. With `parallel`,
    /// dependency edges are ignored and everything is offered at once.
    ///
    /// The visitor owns all error handling; the only thing it can tell the
    /// engine is [`StopExecution`], which cancels the walk without
    /// interrupting tasks already running.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = if parallel {
            // An edgeless copy of the same nodes: every task is immediately
            // ready.
            let mut unordered: petgraph::Graph<TaskNode, ()> = petgraph::Graph::new();
            for node in self.task_graph.node_weights() {
                unordered.add_node(node.clone());
            }
            let (walker, rx) = Walker::new(&unordered).walk();
            // The walker emits indices of the copy, which line up with the
            // original graph because nodes were added in iteration order.
            (walker, rx)
        } else {
            Walker::new(&self.task_graph).walk()
        };
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walker = walker.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("walker yields indices of this graph")
                else {
                    // The root node does no work.
                    done.send(()).ok();
                    return Ok(());
                };

                let _permit = match parallel {
                    false => Some(
                        sema.acquire()
                            .await
                            .expect("concurrency semaphore outlives the walk"),
                    ),
                    true => None,
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                // A dropped callback counts as completion so one crashed
                // visitor task cannot wedge the whole run.
                if let Err(StopExecution) = result.await.unwrap_or(Ok(())) {
                    if walker
                        .lock()
                        .expect("walker mutex poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                done.send(()).ok();
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("task executor panicked")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::{Building, TaskDefinition};

    fn two_task_engine() -> Engine {
        // test depends on build
        let mut engine: crate::Engine<Building> = crate::Engine::new();
        let build = TaskId::from_static("pkg".into(), "build".into());
        let test = TaskId::from_static("pkg".into(), "test".into());
        engine.add_edge(&test, &build);
        engine.connect_to_root(&build);
        engine.add_definition(build, TaskDefinition::default());
        engine.add_definition(test, TaskDefinition::default());
        engine.seal()
    }

    #[tokio::test]
    async fn test_ordered_execution_respects_edges() {
        let engine = Arc::new(two_task_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let mut order = Vec::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            order.push(info.task().to_string());
            callback.send(Ok(())).unwrap();
        }
        handle.await.unwrap().unwrap();
        assert_eq!(order, vec!["build", "test"]);
    }

    #[tokio::test]
    async fn test_parallel_ignores_edges() {
        let engine = Arc::new(two_task_engine());
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(true, 1), tx));

        // Both tasks arrive without either completing first.
        let mut messages = Vec::new();
        for _ in 0..2 {
            messages.push(rx.recv().await.expect("both tasks offered"));
        }
        let mut offered: Vec<_> = messages
            .iter()
            .map(|m| m.info.task().to_string())
            .collect();
        offered.sort();
        assert_eq!(offered, vec!["build", "test"]);
        for message in messages {
            message.callback.send(Ok(())).unwrap();
        }
        drop(rx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_execution_skips_dependents() {
        let engine = Arc::new(two_task_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let mut seen = HashMap::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            seen.insert(info.task().to_string(), ());
            // Fail the first task and stop the walk.
            callback.send(Err(StopExecution)).unwrap();
        }
        handle.await.unwrap().unwrap();
        assert!(seen.contains_key("build"));
        assert!(!seen.contains_key("test"));
    }
}
