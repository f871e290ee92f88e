//! Per-node guardian
//!
//! Owns the cluster view, the mediator and one context per (db,
//! namespace): schema registry, metadata registry, shard directory and
//! the two coordinator actors. Contexts are created on first use and
//! handles are passed downward at construction; metadata events flow
//! through the mediator rather than back-pointers.

use crate::cluster::{ClusterMediator, ClusterView, NoRemoteTransport, NodeTransport};
use crate::commitlog::{CommitLog, CommitLogConfig};
use crate::config::NodeConfig;
use crate::coordinator::{ReadCoordinator, WriteCoordinator};
use crate::error::Result;
use crate::index::ShardDirectory;
use crate::metadata::MetadataRegistry;
use crate::schema::SchemaRegistry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Everything one (db, namespace) needs to serve reads and writes.
pub struct NamespaceContext {
    pub schemas: Arc<SchemaRegistry>,
    pub metadata: Arc<MetadataRegistry>,
    pub shards: Arc<ShardDirectory>,
    pub write: WriteCoordinator,
    pub read: ReadCoordinator,
}

/// Node-wide owner of coordinators and metadata actors.
pub struct NodeGuardian {
    config: NodeConfig,
    cluster: Arc<ClusterView>,
    mediator: ClusterMediator,
    transport: Arc<dyn NodeTransport>,
    namespaces: DashMap<(String, String), Arc<NamespaceContext>>,
}

impl NodeGuardian {
    /// Start the guardian: build the cluster view from configuration and
    /// begin republishing metadata events into the namespace caches.
    pub fn start(config: NodeConfig) -> Arc<Self> {
        Self::start_with_transport(config, Arc::new(NoRemoteTransport))
    }

    pub fn start_with_transport(config: NodeConfig, transport: Arc<dyn NodeTransport>) -> Arc<Self> {
        let cluster = Arc::new(ClusterView::with_nodes(
            config.node_id.clone(),
            config.seed_nodes.iter().cloned(),
        ));
        let mediator = ClusterMediator::new();
        let guardian = Arc::new(Self {
            config,
            cluster,
            mediator,
            transport,
            namespaces: DashMap::new(),
        });
        guardian.spawn_event_republisher();
        info!(node_id = %guardian.config.node_id, "guardian started");
        guardian
    }

    /// Fan metadata events out to every namespace's local cache. The task
    /// holds a weak reference so the guardian can be dropped.
    fn spawn_event_republisher(self: &Arc<Self>) {
        let weak: Weak<NodeGuardian> = Arc::downgrade(self);
        let mut rx = self.mediator.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let Some(guardian) = weak.upgrade() else { break };
                for entry in guardian.namespaces.iter() {
                    if let Err(err) = entry.value().metadata.apply_event(&event) {
                        warn!(%err, "failed to apply metadata event");
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.cluster
    }

    pub fn mediator(&self) -> &ClusterMediator {
        &self.mediator
    }

    /// Number of live (db, namespace) contexts.
    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    /// Shard indexes currently open across all namespaces.
    pub fn open_shard_count(&self) -> usize {
        self.namespaces
            .iter()
            .map(|entry| entry.value().shards.open_count())
            .sum()
    }

    /// Locations known across all namespaces.
    pub fn location_count(&self) -> usize {
        self.namespaces
            .iter()
            .map(|entry| entry.value().metadata.location_count())
            .sum()
    }

    /// The context of one (db, namespace), created on first use.
    pub fn namespace(&self, db: &str, namespace: &str) -> Result<Arc<NamespaceContext>> {
        let key = (db.to_string(), namespace.to_string());
        if let Some(context) = self.namespaces.get(&key) {
            return Ok(context.clone());
        }

        let root = self.config.base_path.join(db).join(namespace);
        let schemas = Arc::new(SchemaRegistry::open(root.join("schema"))?);
        let metadata = Arc::new(MetadataRegistry::open(
            root.join("metadata"),
            db,
            namespace,
            self.config.default_shard_interval_ms,
            self.cluster.clone(),
            self.mediator.clone(),
        )?);
        let shards = Arc::new(ShardDirectory::open(root.join("shards"))?);

        let commit_log = if self.config.commit_log_enabled {
            Some(CommitLog::open(CommitLogConfig::new(root.join("commitlog")))?)
        } else {
            None
        };

        let write = WriteCoordinator::spawn(
            db.to_string(),
            namespace.to_string(),
            schemas.clone(),
            metadata.clone(),
            shards.clone(),
            self.cluster.clone(),
            self.transport.clone(),
            commit_log,
            self.config.write_timeout,
            self.config.metadata_timeout,
        );
        let read = ReadCoordinator::spawn(
            db.to_string(),
            namespace.to_string(),
            schemas.clone(),
            metadata.clone(),
            shards.clone(),
            self.cluster.clone(),
            self.transport.clone(),
            self.config.read_timeout,
            self.config.read_parallelism.effective(),
        );

        let context = Arc::new(NamespaceContext {
            schemas,
            metadata,
            shards,
            write,
            read,
        });
        let entry = self.namespaces.entry(key).or_insert(context);
        info!(db, namespace, "namespace context created");
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use crate::statement::{Projection, SelectStatement};

    fn test_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            base_path: dir.to_path_buf(),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn namespace_contexts_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = NodeGuardian::start(test_config(dir.path()));
        let a = guardian.namespace("db", "ns").unwrap();
        let b = guardian.namespace("db", "ns").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(guardian.namespace_count(), 1);
        guardian.namespace("db", "other").unwrap();
        assert_eq!(guardian.namespace_count(), 2);
    }

    #[tokio::test]
    async fn write_then_read_through_the_guardian() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = NodeGuardian::start(test_config(dir.path()));
        let context = guardian.namespace("db", "ns").unwrap();

        let record = Record::new(5, 1i64).with_tag("name", "John");
        let mapped = context.write.map_input("people", record).await.unwrap();
        assert!(mapped.location.contains(5));

        let result = context
            .read
            .execute_statement(SelectStatement {
                metric: "people".into(),
                projection: Projection::AllFields,
                condition: None,
                group_by: None,
                order_by: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].timestamp, 5);
    }
}
