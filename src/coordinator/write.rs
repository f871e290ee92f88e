//! Write coordinator actor
//!
//! Serialises every mutation of one (db, namespace): record admission
//! with schema evolution, delete statements and metric drops. A record is
//! admitted by evolving the schema, resolving its shard and appending
//! through the shard writer token; the commit log entry goes out before
//! the reply.

use super::plan::reduce_condition;
use crate::cluster::{ClusterView, NodeTransport};
use crate::commitlog::{CommitEntry, CommitLog};
use crate::error::{Error, Result};
use crate::index::ShardDirectory;
use crate::metadata::{Location, MetadataRegistry};
use crate::model::Record;
use crate::schema::{Schema, SchemaRegistry};
use crate::statement::DeleteStatement;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const MAILBOX_DEPTH: usize = 256;

/// Positive reply to a record admission.
#[derive(Debug, Clone)]
pub struct InputMapped {
    pub metric: String,
    pub location: Location,
    pub seq: u64,
}

enum WriteCommand {
    MapInput {
        metric: String,
        record: Record,
        reply: oneshot::Sender<Result<InputMapped>>,
    },
    ExecuteDeleteStatement {
        statement: DeleteStatement,
        reply: oneshot::Sender<Result<u64>>,
    },
    DropMetric {
        metric: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the write coordinator of one (db, namespace).
#[derive(Clone)]
pub struct WriteCoordinator {
    tx: mpsc::Sender<WriteCommand>,
    write_timeout: Duration,
    metadata_timeout: Duration,
}

impl WriteCoordinator {
    /// Spawn the actor task and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        db: String,
        namespace: String,
        schemas: Arc<SchemaRegistry>,
        metadata: Arc<MetadataRegistry>,
        shards: Arc<ShardDirectory>,
        cluster: Arc<ClusterView>,
        transport: Arc<dyn NodeTransport>,
        commit_log: Option<CommitLog>,
        write_timeout: Duration,
        metadata_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let actor = WriteActor {
            db,
            namespace,
            schemas,
            metadata,
            shards,
            cluster,
            transport,
            commit_log: commit_log.map(Mutex::new),
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            write_timeout,
            metadata_timeout,
        }
    }

    /// Admit one record: evolve the schema, route to the owning shard,
    /// append, log, acknowledge.
    pub async fn map_input(&self, metric: impl Into<String>, record: Record) -> Result<InputMapped> {
        self.ask(self.write_timeout, |reply| WriteCommand::MapInput {
            metric: metric.into(),
            record,
            reply,
        })
        .await
    }

    /// Execute a delete statement across the overlapping shards; returns
    /// the number of deleted records.
    pub async fn execute_delete_statement(&self, statement: DeleteStatement) -> Result<u64> {
        self.ask(self.metadata_timeout, |reply| {
            WriteCommand::ExecuteDeleteStatement { statement, reply }
        })
        .await
    }

    /// Drop a metric: schema, locations and shard data. Idempotent.
    pub async fn drop_metric(&self, metric: impl Into<String>) -> Result<()> {
        self.ask(self.metadata_timeout, |reply| WriteCommand::DropMetric {
            metric: metric.into(),
            reply,
        })
        .await
    }

    async fn ask<T>(
        &self,
        timeout: Duration,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Internal("write coordinator stopped".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Internal("write coordinator dropped the reply".into())),
            Ok(Ok(result)) => result,
        }
    }
}

struct WriteActor {
    db: String,
    namespace: String,
    schemas: Arc<SchemaRegistry>,
    metadata: Arc<MetadataRegistry>,
    shards: Arc<ShardDirectory>,
    cluster: Arc<ClusterView>,
    transport: Arc<dyn NodeTransport>,
    commit_log: Option<Mutex<CommitLog>>,
}

impl WriteActor {
    async fn run(self, mut rx: mpsc::Receiver<WriteCommand>) {
        debug!(db = %self.db, namespace = %self.namespace, "write coordinator started");
        while let Some(command) = rx.recv().await {
            match command {
                WriteCommand::MapInput {
                    metric,
                    record,
                    reply,
                } => {
                    let _ = reply.send(self.handle_map_input(&metric, record).await);
                }
                WriteCommand::ExecuteDeleteStatement { statement, reply } => {
                    let _ = reply.send(self.handle_delete(&statement).await);
                }
                WriteCommand::DropMetric { metric, reply } => {
                    let _ = reply.send(self.handle_drop(&metric));
                }
            }
        }
        debug!(db = %self.db, namespace = %self.namespace, "write coordinator stopped");
    }

    async fn handle_map_input(&self, metric: &str, record: Record) -> Result<InputMapped> {
        // schema evolution first: an incompatible record is rejected
        // atomically, before any state changes
        let candidate = Schema::from_record(metric, &record);
        let schema = self.schemas.update(metric, &candidate)?;

        let location = self.metadata.locate(metric, record.timestamp)?;
        let seq = if self.cluster.is_self(&location.node_id) {
            let shard = self.shards.get_or_open(&location)?;
            let mut writer = shard.writer().await;
            writer.write(&schema, &record)?
        } else {
            self.transport
                .forward_write(&location.node_id, &self.db, &self.namespace, metric, record.clone())
                .await?
        };

        if let Some(log) = &self.commit_log {
            log.lock()
                .await
                .append(&CommitEntry {
                    db: self.db.clone(),
                    namespace: self.namespace.clone(),
                    metric: metric.to_string(),
                    record,
                })
                .map_err(|err| {
                    warn!(metric, %err, "commit log append failed");
                    err
                })?;
        }

        Ok(InputMapped {
            metric: metric.to_string(),
            location,
            seq,
        })
    }

    async fn handle_delete(&self, statement: &DeleteStatement) -> Result<u64> {
        let metric = &statement.metric;
        if self.schemas.get(metric).is_none() {
            return Err(Error::MetricNotFound(metric.clone()));
        }
        let (time_range, predicate) = reduce_condition(Some(&statement.condition));

        let mut deleted = 0;
        for location in self.metadata.locations_overlapping(metric, time_range) {
            if self.cluster.is_self(&location.node_id) {
                let shard = self.shards.get_or_open(&location)?;
                let mut writer = shard.writer().await;
                deleted += writer.delete_by_query(&predicate)?;
            } else {
                deleted += self
                    .transport
                    .execute_delete(
                        &location.node_id.clone(),
                        &self.db,
                        &self.namespace,
                        location,
                        predicate.clone(),
                    )
                    .await?;
            }
        }
        info!(metric, deleted, "delete statement executed");
        Ok(deleted)
    }

    fn handle_drop(&self, metric: &str) -> Result<()> {
        self.shards.remove_metric(metric)?;
        self.metadata.drop_metric(metric)?;
        self.schemas.delete(metric)?;
        info!(metric, "metric dropped");
        Ok(())
    }
}
