//! Cluster membership view, metadata pub/sub and the remote call seam
//!
//! The gossip substrate itself is an external collaborator; this module
//! assumes a converged set of node identifiers and provides the mediator
//! used to fan metadata events out to every node's local cache.

use crate::error::{Error, Result};
use crate::index::IndexPredicate;
use crate::metadata::Location;
use crate::model::Record;
use crate::statement::{Aggregation, OrderClause, Projection};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tokio::sync::broadcast;

/// The stable membership snapshot this node acts on.
///
/// Placement reads the sorted node set, so every node computes the same
/// owner for a new shard without coordination.
#[derive(Debug)]
pub struct ClusterView {
    self_id: String,
    nodes: RwLock<BTreeSet<String>>,
}

impl ClusterView {
    /// A view containing only this node.
    pub fn single(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        let mut nodes = BTreeSet::new();
        nodes.insert(self_id.clone());
        Self {
            self_id,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn with_nodes(
        self_id: impl Into<String>,
        members: impl IntoIterator<Item = String>,
    ) -> Self {
        let self_id = self_id.into();
        let mut nodes: BTreeSet<String> = members.into_iter().collect();
        nodes.insert(self_id.clone());
        Self {
            self_id,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn is_self(&self, node_id: &str) -> bool {
        self.self_id == node_id
    }

    /// Sorted member identifiers.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.read().iter().cloned().collect()
    }

    pub fn add_node(&self, node_id: impl Into<String>) {
        self.nodes.write().insert(node_id.into());
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.write().remove(node_id);
    }
}

/// Metadata change broadcast to every node.
#[derive(Debug, Clone)]
pub enum MetadataEvent {
    LocationCreated {
        db: String,
        namespace: String,
        location: Location,
    },
    MetricInfoPut {
        db: String,
        namespace: String,
        metric: String,
        shard_interval_ms: u64,
    },
}

/// Cluster-wide pub/sub channel for metadata events.
#[derive(Debug, Clone)]
pub struct ClusterMediator {
    sender: broadcast::Sender<MetadataEvent>,
}

impl ClusterMediator {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publish an event; nodes without subscribers simply drop it.
    pub fn publish(&self, event: MetadataEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataEvent> {
        self.sender.subscribe()
    }
}

impl Default for ClusterMediator {
    fn default() -> Self {
        Self::new()
    }
}

/// One shard subquery shipped to the owning node.
#[derive(Debug, Clone)]
pub struct RemoteShardQuery {
    pub db: String,
    pub namespace: String,
    pub location: Location,
    pub predicate: IndexPredicate,
    pub projection: Projection,
    pub group_by: Option<(String, Aggregation)>,
    pub limit: Option<usize>,
    pub sort: Option<OrderClause>,
}

/// Reply of a remote shard call.
#[derive(Debug, Clone)]
pub enum RemoteShardReply {
    Records(Vec<Record>),
    Count(u64),
}

/// Remote calls to other nodes. The wire binding is pluggable; a
/// single-node deployment runs without one.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Forward a record write to the node owning its shard.
    async fn forward_write(
        &self,
        node_id: &str,
        db: &str,
        namespace: &str,
        metric: &str,
        record: Record,
    ) -> Result<u64>;

    /// Execute one shard subquery on its owning node.
    async fn execute_query(&self, node_id: &str, query: RemoteShardQuery)
        -> Result<RemoteShardReply>;

    /// Count matches of one shard subquery on its owning node.
    async fn execute_count(&self, node_id: &str, query: RemoteShardQuery) -> Result<u64>;

    /// Delete matches of a predicate on a remote shard.
    async fn execute_delete(
        &self,
        node_id: &str,
        db: &str,
        namespace: &str,
        location: Location,
        predicate: IndexPredicate,
    ) -> Result<u64>;
}

/// Transport for deployments without remote peers: every remote call
/// reports the owner as unreachable.
#[derive(Debug, Default)]
pub struct NoRemoteTransport;

#[async_trait]
impl NodeTransport for NoRemoteTransport {
    async fn forward_write(
        &self,
        node_id: &str,
        _db: &str,
        _namespace: &str,
        _metric: &str,
        _record: Record,
    ) -> Result<u64> {
        Err(Error::Unavailable(node_id.to_string()))
    }

    async fn execute_query(
        &self,
        node_id: &str,
        _query: RemoteShardQuery,
    ) -> Result<RemoteShardReply> {
        Err(Error::Unavailable(node_id.to_string()))
    }

    async fn execute_count(&self, node_id: &str, _query: RemoteShardQuery) -> Result<u64> {
        Err(Error::Unavailable(node_id.to_string()))
    }

    async fn execute_delete(
        &self,
        node_id: &str,
        _db: &str,
        _namespace: &str,
        _location: Location,
        _predicate: IndexPredicate,
    ) -> Result<u64> {
        Err(Error::Unavailable(node_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_keeps_members_sorted() {
        let view = ClusterView::with_nodes("node-b", ["node-c".to_string()]);
        view.add_node("node-a");
        assert_eq!(view.nodes(), vec!["node-a", "node-b", "node-c"]);
        view.remove_node("node-c");
        assert_eq!(view.nodes(), vec!["node-a", "node-b"]);
        assert!(view.is_self("node-b"));
    }

    #[tokio::test]
    async fn mediator_fans_out_to_subscribers() {
        let mediator = ClusterMediator::new();
        let mut rx = mediator.subscribe();
        mediator.publish(MetadataEvent::MetricInfoPut {
            db: "db".into(),
            namespace: "ns".into(),
            metric: "people".into(),
            shard_interval_ms: 100,
        });
        match rx.recv().await.unwrap() {
            MetadataEvent::MetricInfoPut { metric, .. } => assert_eq!(metric, "people"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
