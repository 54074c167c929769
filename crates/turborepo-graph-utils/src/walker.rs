use std::{collections::HashMap, hash::Hash, marker::PhantomData};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// A node ready for processing, paired with the channel the consumer uses
/// to report that processing finished.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

pub struct Start;
pub struct Walking;

/// Concurrent dependency-ordered traversal of a DAG.
///
/// Each node gets its own tokio task that waits for every outgoing
/// neighbor (its dependencies) to announce completion, then offers the node
/// to the consumer. The consumer decides when the node counts as done by
/// completing the callback; only then do dependents unblock. Cancellation
/// stops new emissions without interrupting nodes already handed out.
///
/// The graph must not change between construction and the walk.
pub struct Walker<N, S> {
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
    marker: PhantomData<S>,
}

impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);

        // One single-shot broadcast per node announces its completion to
        // every dependent.
        let mut done_txs = HashMap::new();
        let mut done_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            let (tx, rx) = broadcast::channel::<()>(1);
            done_txs.insert(node, tx);
            done_rxs.insert(node, rx);
        }

        // Sized so that emitting can never block: each node sends at most
        // once.
        let (node_tx, node_rx) = mpsc::channel(done_txs.len().max(1));
        let join_handles = FuturesUnordered::new();

        for node in graph.node_identifiers() {
            let done_tx = done_txs
                .remove(&node)
                .expect("every node was given a sender");
            let node_tx = node_tx.clone();
            let mut cancel_rx = cancel_rx.clone();
            let mut dep_rxs: Vec<_> = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    done_rxs
                        .get(&dep)
                        .expect("neighbors are nodes of the same graph")
                        .resubscribe()
                })
                .collect();

            join_handles.push(tokio::spawn(async move {
                let deps_done = join_all(dep_rxs.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // When cancellation races with readiness, prefer the
                    // cancellation.
                    biased;
                    _ = cancel_rx.changed() => {}
                    results = deps_done => {
                        for result in results {
                            match result {
                                Ok(()) => (),
                                // A dependency task exited without
                                // announcing completion; treat as cancel.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(_)) => {
                                    trace!("dependency announced completion more than once");
                                }
                            }
                        }

                        let (callback_tx, callback_rx) = oneshot::channel();
                        if node_tx.send((node, callback_tx)).await.is_err() {
                            // Consumer hung up; nothing left to coordinate.
                            return;
                        }
                        // A dropped callback is treated as completion so a
                        // sloppy consumer cannot deadlock the walk.
                        callback_rx.await.ok();
                        // No receivers means no dependents, which is fine.
                        done_tx.send(()).ok();
                    }
                }
            }));
        }

        debug_assert!(done_txs.is_empty(), "all senders moved into node tasks");

        Self {
            cancel,
            node_events: Some(node_rx),
            join_handles,
            marker: PhantomData,
        }
    }

    /// Starts the traversal, handing back the stream of ready nodes.
    pub fn walk(mut self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let node_events = self
            .node_events
            .take()
            .expect("walker can only start walking once");
        (
            Walker {
                cancel: self.cancel,
                node_events: None,
                join_handles: self.join_handles,
                marker: PhantomData,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already queued still arrive.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for every node task to wind down.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let mut join_handles = self.join_handles;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_dependencies_come_first() {
        // a depends on b depends on c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (walker, mut nodes) = Walker::new(&g).walk();
        let mut order = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            order.push(node);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(order, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_nodes() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (mut walker, mut nodes) = Walker::new(&g).walk();
        let mut seen = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            walker.cancel().unwrap();
            seen.push(node);
            done.send(()).unwrap();
        }
        assert_eq!(seen, vec![c]);
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_branches_progress() {
        // a depends on b and d; a slow d must not hold up b's subtree
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());

        let (walker, mut nodes) = Walker::new(&g).walk();
        let mut held_d = None;
        let mut order = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            if node == d {
                // Hold d open until b has finished.
                held_d = Some(done);
            } else {
                order.push(node);
                done.send(()).unwrap();
            }
            if order.ends_with(&[c, b]) {
                if let Some(done) = held_d.take() {
                    order.push(d);
                    done.send(()).unwrap();
                }
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(order, vec![c, b, d, a]);
    }
}
