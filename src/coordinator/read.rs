//! Read coordinator actor
//!
//! Translates a select statement into shard subqueries, fans them out to
//! the owning nodes on a bounded worker pool, and merges the partials:
//! concatenation or k-way merge for rows, additive or element-wise
//! reduction for grouped aggregates. The statement deadline cancels
//! outstanding subqueries.

use super::plan::{plan_select, PlanKind, QueryPlan};
use crate::cluster::{ClusterView, NodeTransport, RemoteShardQuery, RemoteShardReply};
use crate::error::{Error, Result};
use crate::index::{compare_records, ShardDirectory};
use crate::metadata::{Location, MetadataRegistry};
use crate::model::{Record, Scalar, COUNT_FIELD};
use crate::schema::{Schema, SchemaRegistry};
use crate::statement::{Aggregation, OrderClause, SelectStatement};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

const MAILBOX_DEPTH: usize = 256;

/// Merged result of a select statement.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub records: Vec<Record>,
    /// Documents dropped during record reconstruction instead of failing
    /// the statement
    pub skipped: u64,
}

enum ReadCommand {
    ExecuteStatement {
        statement: SelectStatement,
        reply: oneshot::Sender<Result<QueryResult>>,
    },
}

/// Handle to the read coordinator of one (db, namespace).
#[derive(Clone)]
pub struct ReadCoordinator {
    tx: mpsc::Sender<ReadCommand>,
    ask_timeout: Duration,
}

impl ReadCoordinator {
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
        deadline: Duration,
        parallelism: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let context = Arc::new(ReadContext {
            db,
            namespace,
            schemas,
            metadata,
            shards,
            cluster,
            transport,
            deadline,
            pool: Arc::new(Semaphore::new(parallelism.max(1))),
        });
        tokio::spawn(run(context, rx));
        Self {
            tx,
            // the statement deadline fires inside the actor; the ask gets
            // headroom so the caller sees the precise error
            ask_timeout: deadline + Duration::from_secs(1),
        }
    }

    /// Execute a select statement.
    pub async fn execute_statement(&self, statement: SelectStatement) -> Result<QueryResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReadCommand::ExecuteStatement { statement, reply })
            .await
            .map_err(|_| Error::Internal("read coordinator stopped".into()))?;
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Internal("read coordinator dropped the reply".into())),
            Ok(Ok(result)) => result,
        }
    }
}

struct ReadContext {
    db: String,
    namespace: String,
    schemas: Arc<SchemaRegistry>,
    metadata: Arc<MetadataRegistry>,
    shards: Arc<ShardDirectory>,
    cluster: Arc<ClusterView>,
    transport: Arc<dyn NodeTransport>,
    deadline: Duration,
    pool: Arc<Semaphore>,
}

async fn run(context: Arc<ReadContext>, mut rx: mpsc::Receiver<ReadCommand>) {
    debug!(db = %context.db, namespace = %context.namespace, "read coordinator started");
    while let Some(ReadCommand::ExecuteStatement { statement, reply }) = rx.recv().await {
        // the fan-out runs on the pool so the mailbox keeps draining
        let context = context.clone();
        tokio::spawn(async move {
            let _ = reply.send(execute(context, statement).await);
        });
    }
}

async fn execute(context: Arc<ReadContext>, statement: SelectStatement) -> Result<QueryResult> {
    let schema = context
        .schemas
        .get(&statement.metric)
        .ok_or_else(|| Error::MetricNotFound(statement.metric.clone()))?;
    let plan = Arc::new(plan_select(&schema, &statement)?);

    let locations = context
        .metadata
        .locations_overlapping(&plan.metric, plan.time_range);
    debug!(
        metric = %plan.metric,
        shards = locations.len(),
        range = ?plan.time_range,
        "statement planned"
    );
    if locations.is_empty() {
        return Ok(empty_result(&plan));
    }

    let mut tasks: JoinSet<Result<(usize, ShardPartial)>> = JoinSet::new();
    for (index, location) in locations.into_iter().enumerate() {
        let context = context.clone();
        let schema = schema.clone();
        let plan = plan.clone();
        tasks.spawn(async move {
            let _permit = context
                .pool
                .acquire()
                .await
                .map_err(|_| Error::Internal("read pool closed".into()))?;
            let partial = execute_shard(&context, &schema, &plan, location).await?;
            Ok((index, partial))
        });
    }

    match tokio::time::timeout(context.deadline, collect(&mut tasks)).await {
        Err(_) => {
            tasks.abort_all();
            Err(Error::Timeout)
        }
        Ok(Err(err)) => {
            tasks.abort_all();
            Err(err)
        }
        Ok(Ok(partials)) => merge(&plan, partials),
    }
}

async fn collect(
    tasks: &mut JoinSet<Result<(usize, ShardPartial)>>,
) -> Result<Vec<(usize, ShardPartial)>> {
    let mut partials = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let partial = joined.map_err(|e| Error::Internal(format!("shard subquery died: {e}")))??;
        partials.push(partial);
    }
    Ok(partials)
}

enum ShardPartial {
    Rows { records: Vec<Record>, skipped: u64 },
    Count(u64),
    Groups(Vec<Record>),
}

async fn execute_shard(
    context: &ReadContext,
    schema: &Schema,
    plan: &QueryPlan,
    location: Location,
) -> Result<ShardPartial> {
    if context.cluster.is_self(&location.node_id) {
        let shard = context.shards.get_or_open(&location)?;
        Ok(match &plan.kind {
            PlanKind::Select => {
                let outcome = shard.query(
                    schema,
                    &plan.predicate,
                    &plan.projection,
                    plan.limit,
                    plan.sort.as_ref(),
                );
                ShardPartial::Rows {
                    records: outcome.records,
                    skipped: outcome.skipped,
                }
            }
            PlanKind::GlobalCount => ShardPartial::Count(
                shard.count_query(&plan.predicate, plan.limit.map(|l| l as u64)),
            ),
            PlanKind::Grouped { field, aggregator } => ShardPartial::Groups(
                shard.grouped_aggregation(
                    schema,
                    &plan.predicate,
                    field,
                    *aggregator,
                    None,
                    plan.sort.as_ref(),
                ),
            ),
        })
    } else {
        let query = RemoteShardQuery {
            db: context.db.clone(),
            namespace: context.namespace.clone(),
            location: location.clone(),
            predicate: plan.predicate.clone(),
            projection: plan.projection.clone(),
            group_by: match &plan.kind {
                PlanKind::Grouped { field, aggregator } => Some((field.clone(), *aggregator)),
                _ => None,
            },
            limit: plan.limit,
            sort: plan.sort.clone(),
        };
        match &plan.kind {
            PlanKind::GlobalCount => Ok(ShardPartial::Count(
                context
                    .transport
                    .execute_count(&location.node_id, query)
                    .await?,
            )),
            PlanKind::Grouped { .. } => {
                match context
                    .transport
                    .execute_query(&location.node_id, query)
                    .await?
                {
                    RemoteShardReply::Records(records) => Ok(ShardPartial::Groups(records)),
                    RemoteShardReply::Count(_) => {
                        Err(Error::Internal("count reply to a grouped subquery".into()))
                    }
                }
            }
            PlanKind::Select => {
                match context
                    .transport
                    .execute_query(&location.node_id, query)
                    .await?
                {
                    RemoteShardReply::Records(records) => Ok(ShardPartial::Rows {
                        records,
                        skipped: 0,
                    }),
                    RemoteShardReply::Count(_) => {
                        Err(Error::Internal("count reply to a row subquery".into()))
                    }
                }
            }
        }
    }
}

fn empty_result(plan: &QueryPlan) -> QueryResult {
    match plan.kind {
        PlanKind::GlobalCount => QueryResult {
            records: vec![count_record(0)],
            skipped: 0,
        },
        _ => QueryResult::default(),
    }
}

fn count_record(total: u64) -> Record {
    let mut record = Record::new(0, Scalar::BigInt(total as i64));
    record
        .tags
        .insert(COUNT_FIELD.to_string(), Scalar::BigInt(total as i64));
    record
}

fn merge(plan: &QueryPlan, mut partials: Vec<(usize, ShardPartial)>) -> Result<QueryResult> {
    // shard completion order is arbitrary; restore time order
    partials.sort_by_key(|(index, _)| *index);

    match &plan.kind {
        PlanKind::Select => {
            let mut parts = Vec::with_capacity(partials.len());
            let mut skipped = 0;
            for (_, partial) in partials {
                match partial {
                    ShardPartial::Rows { records, skipped: s } => {
                        parts.push(records);
                        skipped += s;
                    }
                    _ => return Err(Error::Internal("mismatched shard partial".into())),
                }
            }
            let records = match &plan.sort {
                Some(clause) => kway_merge(parts, clause, plan.limit),
                None => {
                    let mut records: Vec<Record> = parts.into_iter().flatten().collect();
                    if let Some(limit) = plan.limit {
                        records.truncate(limit);
                    }
                    records
                }
            };
            Ok(QueryResult { records, skipped })
        }
        PlanKind::GlobalCount => {
            let mut total = 0u64;
            for (_, partial) in partials {
                match partial {
                    ShardPartial::Count(count) => total += count,
                    _ => return Err(Error::Internal("mismatched shard partial".into())),
                }
            }
            if let Some(limit) = plan.limit {
                total = total.min(limit as u64);
            }
            Ok(QueryResult {
                records: vec![count_record(total)],
                skipped: 0,
            })
        }
        PlanKind::Grouped { field, aggregator } => {
            let mut groups = Vec::new();
            for (_, partial) in partials {
                match partial {
                    ShardPartial::Groups(records) => groups.push(records),
                    _ => return Err(Error::Internal("mismatched shard partial".into())),
                }
            }
            let records =
                merge_groups(groups, field, *aggregator, plan.sort.as_ref(), plan.limit)?;
            Ok(QueryResult {
                records,
                skipped: 0,
            })
        }
    }
}

/// K-way merge of per-shard sorted runs by the sort key.
fn kway_merge(
    mut parts: Vec<Vec<Record>>,
    clause: &OrderClause,
    limit: Option<usize>,
) -> Vec<Record> {
    let mut cursors = vec![0usize; parts.len()];
    let total: usize = parts.iter().map(Vec::len).sum();
    let target = limit.unwrap_or(total).min(total);

    let mut merged = Vec::with_capacity(target);
    while merged.len() < target {
        let mut best: Option<usize> = None;
        for (part, cursor) in cursors.iter().enumerate() {
            if *cursor >= parts[part].len() {
                continue;
            }
            best = match best {
                None => Some(part),
                Some(current)
                    if compare_records(
                        &parts[part][*cursor],
                        &parts[current][cursors[current]],
                        clause,
                    ) == Ordering::Less =>
                {
                    Some(part)
                }
                Some(current) => Some(current),
            };
        }
        let Some(part) = best else { break };
        let cursor = cursors[part];
        cursors[part] += 1;
        merged.push(std::mem::replace(
            &mut parts[part][cursor],
            Record::new(0, 0i64),
        ));
    }
    merged
}

struct MergedGroup {
    key: Scalar,
    value: Scalar,
    count: i64,
    count_known: bool,
    timestamp: i64,
}

/// Reduce per-shard group partials: `sum`/`count` add, `min`/`max` take
/// the element-wise extreme, `avg` divides the summed values by the
/// summed count channel.
fn merge_groups(
    partials: Vec<Vec<Record>>,
    group_field: &str,
    aggregator: Aggregation,
    sort: Option<&OrderClause>,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    let mut merged: BTreeMap<String, MergedGroup> = BTreeMap::new();

    for record in partials.into_iter().flatten() {
        let key = record
            .dimensions
            .get(group_field)
            .cloned()
            .ok_or_else(|| Error::Internal("group partial without its key".into()))?;
        let count = record.tags.get(COUNT_FIELD).and_then(Scalar::as_i64);
        if aggregator == Aggregation::Avg && count.is_none() {
            return Err(Error::UnsupportedDistributedAvg);
        }

        match merged.entry(key.key_repr()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(MergedGroup {
                    key,
                    value: record.value.clone(),
                    count: count.unwrap_or(0),
                    count_known: count.is_some(),
                    timestamp: record.timestamp,
                });
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let group = entry.get_mut();
                group.value = match aggregator {
                    Aggregation::Sum | Aggregation::Count | Aggregation::Avg => {
                        add_scalars(&group.value, &record.value)
                    }
                    Aggregation::Min => min_scalar(&group.value, &record.value),
                    Aggregation::Max => max_scalar(&group.value, &record.value),
                };
                group.count += count.unwrap_or(0);
                group.count_known &= count.is_some();
                group.timestamp = group.timestamp.max(record.timestamp);
            }
        }
    }

    let mut records: Vec<Record> = merged
        .into_values()
        .map(|group| {
            let value = match aggregator {
                Aggregation::Avg => {
                    let sum = group.value.as_f64().unwrap_or(0.0);
                    Scalar::Decimal(sum / group.count.max(1) as f64)
                }
                _ => group.value,
            };
            let mut record = Record::new(group.timestamp, value);
            record
                .dimensions
                .insert(group_field.to_string(), group.key);
            if group.count_known {
                record
                    .tags
                    .insert(COUNT_FIELD.to_string(), Scalar::BigInt(group.count));
            }
            record
        })
        .collect();

    // global sort on the reduced groups, then truncate
    if let Some(clause) = sort {
        records.sort_by(|a, b| compare_records(a, b, clause));
    }
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}

fn add_scalars(a: &Scalar, b: &Scalar) -> Scalar {
    match (a, b) {
        (Scalar::BigInt(x), Scalar::BigInt(y)) => Scalar::BigInt(x.wrapping_add(*y)),
        _ => Scalar::Decimal(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
    }
}

fn min_scalar(a: &Scalar, b: &Scalar) -> Scalar {
    if b.compare(a) == Some(Ordering::Less) {
        b.clone()
    } else {
        a.clone()
    }
}

fn max_scalar(a: &Scalar, b: &Scalar) -> Scalar {
    if b.compare(a) == Some(Ordering::Greater) {
        b.clone()
    } else {
        a.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: i64, value: i64) -> Record {
        Record::new(ts, value)
    }

    fn group(key: &str, value: Scalar, count: Option<i64>) -> Record {
        let mut record = Record::new(0, value);
        record
            .dimensions
            .insert("name".to_string(), Scalar::Varchar(key.into()));
        if let Some(count) = count {
            record
                .tags
                .insert(COUNT_FIELD.to_string(), Scalar::BigInt(count));
        }
        record
    }

    #[test]
    fn kway_merge_is_ordered_and_limited() {
        let clause = OrderClause {
            field: "timestamp".into(),
            descending: false,
        };
        let merged = kway_merge(
            vec![
                vec![row(1, 0), row(5, 0), row(9, 0)],
                vec![row(2, 0), row(3, 0)],
                vec![row(4, 0)],
            ],
            &clause,
            Some(4),
        );
        let stamps: Vec<i64> = merged.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3, 4]);
    }

    #[test]
    fn merge_groups_adds_sums_across_shards() {
        let partials = vec![
            vec![
                group("John", Scalar::BigInt(1), Some(1)),
                group("Bill", Scalar::BigInt(1), Some(1)),
            ],
            vec![group("John", Scalar::BigInt(1), Some(1))],
        ];
        let merged = merge_groups(partials, "name", Aggregation::Sum, None, None).unwrap();
        assert_eq!(merged.len(), 2);
        let john = merged
            .iter()
            .find(|r| r.dimensions["name"] == Scalar::Varchar("John".into()))
            .unwrap();
        assert_eq!(john.value, Scalar::BigInt(2));
        assert_eq!(john.tags[COUNT_FIELD], Scalar::BigInt(2));
    }

    #[test]
    fn merge_groups_takes_elementwise_extremes() {
        let partials = vec![
            vec![group("John", Scalar::BigInt(5), Some(2))],
            vec![group("John", Scalar::BigInt(3), Some(1))],
        ];
        let min = merge_groups(partials.clone(), "name", Aggregation::Min, None, None).unwrap();
        assert_eq!(min[0].value, Scalar::BigInt(3));
        let max = merge_groups(partials, "name", Aggregation::Max, None, None).unwrap();
        assert_eq!(max[0].value, Scalar::BigInt(5));
    }

    #[test]
    fn distributed_avg_requires_count_channel() {
        let partials = vec![
            vec![group("John", Scalar::BigInt(6), Some(2))],
            vec![group("John", Scalar::BigInt(2), None)],
        ];
        assert!(matches!(
            merge_groups(partials, "name", Aggregation::Avg, None, None),
            Err(Error::UnsupportedDistributedAvg)
        ));

        let counted = vec![
            vec![group("John", Scalar::BigInt(6), Some(2))],
            vec![group("John", Scalar::BigInt(2), Some(2))],
        ];
        let merged = merge_groups(counted, "name", Aggregation::Avg, None, None).unwrap();
        assert_eq!(merged[0].value, Scalar::Decimal(2.0));
    }

    #[test]
    fn grouped_sort_applies_after_reduction() {
        let partials = vec![vec![
            group("a", Scalar::BigInt(1), Some(1)),
            group("b", Scalar::BigInt(5), Some(1)),
            group("c", Scalar::BigInt(3), Some(1)),
        ]];
        let clause = OrderClause {
            field: "value".into(),
            descending: true,
        };
        let merged =
            merge_groups(partials, "name", Aggregation::Sum, Some(&clause), Some(2)).unwrap();
        let values: Vec<&Scalar> = merged.iter().map(|r| &r.value).collect();
        assert_eq!(values, vec![&Scalar::BigInt(5), &Scalar::BigInt(3)]);
    }
}
