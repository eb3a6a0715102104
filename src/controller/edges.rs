//! Denormalization edges and their coalescer.
//!
//! An edge asserts a parent→children relationship that the denormalization
//! loop must reflect in the parent's cached bytes. The coalescer merges
//! consecutive edges that share a `(kind, parent)` pair so a busy parent is
//! deserialized at most once per coalescence window.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Works attaching to an author.
    Author,
    /// Books (editions) attaching to a work.
    Work,
}

/// A parent→children assertion sent to the denormalization pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub parent_id: i64,
    pub child_ids: Vec<i64>,
}

impl Edge {
    pub fn author(parent_id: i64, child_ids: Vec<i64>) -> Self {
        Self {
            kind: EdgeKind::Author,
            parent_id,
            child_ids,
        }
    }

    pub fn work(parent_id: i64, child_ids: Vec<i64>) -> Self {
        Self {
            kind: EdgeKind::Work,
            parent_id,
            child_ids,
        }
    }

    fn merges_with(&self, other: &Edge) -> bool {
        self.kind == other.kind && self.parent_id == other.parent_id
    }
}

/// Groups edges of the same kind and parent so the consumer deserializes the
/// parent once per run instead of once per child.
///
/// An accumulated edge is yielded when a different `(kind, parent)` arrives,
/// when no edge arrives within `wait`, or when the channel closes. Emitters
/// quiesce by dropping their senders; once every sender is gone the final
/// edge is yielded and `next` returns `None`.
pub struct EdgeCoalescer {
    rx: mpsc::Receiver<Edge>,
    pending: Option<Edge>,
    wait: Duration,
}

impl EdgeCoalescer {
    pub fn new(rx: mpsc::Receiver<Edge>, wait: Duration) -> Self {
        Self {
            rx,
            pending: None,
            wait,
        }
    }

    pub async fn next(&mut self) -> Option<Edge> {
        let mut current = match self.pending.take() {
            Some(edge) => edge,
            None => self.rx.recv().await?,
        };

        loop {
            match timeout(self.wait, self.rx.recv()).await {
                // Quiet period with no new edges: flush what we have.
                Err(_) => return Some(current),
                // Channel closed: flush the last edge; the next call ends.
                Ok(None) => return Some(current),
                Ok(Some(next)) => {
                    if current.merges_with(&next) {
                        current.child_ids.extend(next.child_ids);
                        continue;
                    }
                    self.pending = Some(next);
                    return Some(current);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn consecutive_same_parent_edges_merge() {
        let (tx, rx) = mpsc::channel(8);
        let mut coalescer = EdgeCoalescer::new(rx, WAIT);

        tx.send(Edge::work(1, vec![10])).await.unwrap();
        tx.send(Edge::work(1, vec![20, 30])).await.unwrap();
        drop(tx);

        let edge = coalescer.next().await.expect("merged edge");
        assert_eq!(edge, Edge::work(1, vec![10, 20, 30]));
        assert!(coalescer.next().await.is_none());
    }

    #[tokio::test]
    async fn different_parent_flushes_previous_edge() {
        let (tx, rx) = mpsc::channel(8);
        let mut coalescer = EdgeCoalescer::new(rx, WAIT);

        tx.send(Edge::work(1, vec![10])).await.unwrap();
        tx.send(Edge::work(2, vec![20])).await.unwrap();
        tx.send(Edge::author(2, vec![30])).await.unwrap();
        drop(tx);

        assert_eq!(coalescer.next().await, Some(Edge::work(1, vec![10])));
        assert_eq!(coalescer.next().await, Some(Edge::work(2, vec![20])));
        assert_eq!(coalescer.next().await, Some(Edge::author(2, vec![30])));
        assert!(coalescer.next().await.is_none());
    }

    #[tokio::test]
    async fn same_parent_different_kind_does_not_merge() {
        let (tx, rx) = mpsc::channel(8);
        let mut coalescer = EdgeCoalescer::new(rx, WAIT);

        tx.send(Edge::work(1, vec![10])).await.unwrap();
        tx.send(Edge::author(1, vec![10])).await.unwrap();
        drop(tx);

        assert_eq!(coalescer.next().await, Some(Edge::work(1, vec![10])));
        assert_eq!(coalescer.next().await, Some(Edge::author(1, vec![10])));
    }

    #[tokio::test]
    async fn wait_timeout_yields_and_blocks_for_more() {
        let (tx, rx) = mpsc::channel(8);
        let mut coalescer = EdgeCoalescer::new(rx, WAIT);

        tx.send(Edge::work(1, vec![10])).await.unwrap();
        assert_eq!(coalescer.next().await, Some(Edge::work(1, vec![10])));

        // A later edge for the same parent starts a fresh accumulation.
        tx.send(Edge::work(1, vec![20])).await.unwrap();
        drop(tx);
        assert_eq!(coalescer.next().await, Some(Edge::work(1, vec![20])));
        assert!(coalescer.next().await.is_none());
    }

    #[tokio::test]
    async fn interleaving_preserves_child_union_and_adjacency() {
        let (tx, rx) = mpsc::channel(16);
        let mut coalescer = EdgeCoalescer::new(rx, WAIT);

        let submitted = [
            Edge::author(5, vec![1]),
            Edge::author(5, vec![2]),
            Edge::work(5, vec![3]),
            Edge::work(6, vec![4]),
            Edge::author(5, vec![5]),
        ];
        for edge in &submitted {
            tx.send(edge.clone()).await.unwrap();
        }
        drop(tx);

        let mut yielded = Vec::new();
        while let Some(edge) = coalescer.next().await {
            yielded.push(edge);
        }

        // Consecutive yields never share (kind, parent).
        for pair in yielded.windows(2) {
            assert!(!pair[0].merges_with(&pair[1]));
        }

        // The union of yielded children equals the union submitted.
        let mut submitted_children: Vec<i64> =
            submitted.iter().flat_map(|e| e.child_ids.clone()).collect();
        let mut yielded_children: Vec<i64> =
            yielded.iter().flat_map(|e| e.child_ids.clone()).collect();
        submitted_children.sort_unstable();
        yielded_children.sort_unstable();
        assert_eq!(submitted_children, yielded_children);
    }
}
