//! Structured record index for one shard
//!
//! One `ShardIndex` instance exists per location. Documents live in an
//! append-only JSON-line segment on disk; postings (roaring doc-id sets
//! keyed by term or point value) are rebuilt from the segment on open.
//! Readers take an immutable snapshot of the whole shard state; the writer
//! token serialises mutations and swaps a fresh snapshot in on commit, so
//! concurrent reads never observe a half-applied write. Deletes rewrite
//! the segment without the dead documents.

use super::predicate::{analyze, IndexPredicate, RangeBound};
use crate::error::Result;
use crate::model::{
    materialize, FieldClass, Record, Scalar, COUNT_FIELD, TIMESTAMP_FIELD, VALUE_FIELD,
};
use crate::schema::Schema;
use crate::statement::{Aggregation, OrderClause, Projection};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write as _;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const SEGMENT_FILE: &str = "segment.log";

/// Monotone encoding of a numeric scalar for ordered point postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PointKey(u64);

impl PointKey {
    fn from_scalar(scalar: &Scalar) -> Option<Self> {
        scalar.as_f64().map(|v| {
            let bits = v.to_bits();
            let key = if bits >> 63 == 1 {
                !bits
            } else {
                bits | (1 << 63)
            };
            PointKey(key)
        })
    }
}

/// One stored document: the materialised fields of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Document {
    seq: u64,
    timestamp: i64,
    value: Scalar,
    #[serde(default)]
    fields: BTreeMap<String, Scalar>,
}

impl Document {
    fn from_record(seq: u64, record: &Record) -> Self {
        Self {
            seq,
            timestamp: record.timestamp,
            value: record.value.clone(),
            fields: record
                .fields()
                .map(|(name, scalar)| (name.clone(), scalar.clone()))
                .collect(),
        }
    }

    /// Stored scalar by name, resolving the reserved fields.
    fn scalar(&self, name: &str) -> Option<Scalar> {
        match name {
            TIMESTAMP_FIELD => Some(Scalar::BigInt(self.timestamp)),
            VALUE_FIELD => Some(self.value.clone()),
            _ => self.fields.get(name).cloned(),
        }
    }
}

/// Immutable point-in-time state of a shard.
#[derive(Debug, Default, Clone)]
struct ShardState {
    docs: Vec<Arc<Document>>,
    live: RoaringBitmap,
    terms: HashMap<String, HashMap<String, RoaringBitmap>>,
    points: HashMap<String, BTreeMap<PointKey, RoaringBitmap>>,
    next_seq: u64,
}

impl ShardState {
    fn rebuild(docs: Vec<Arc<Document>>) -> Self {
        let mut state = ShardState {
            next_seq: docs.iter().map(|d| d.seq + 1).max().unwrap_or(0),
            ..Default::default()
        };
        for doc in docs {
            state.append(doc);
        }
        state
    }

    fn append(&mut self, doc: Arc<Document>) {
        let id = self.docs.len() as u32;
        self.index_scalar(id, TIMESTAMP_FIELD, &Scalar::BigInt(doc.timestamp));
        self.index_scalar(id, VALUE_FIELD, &doc.value);
        for (name, scalar) in &doc.fields {
            self.index_scalar(id, name, scalar);
        }
        self.live.insert(id);
        self.next_seq = self.next_seq.max(doc.seq + 1);
        self.docs.push(doc);
    }

    fn index_scalar(&mut self, id: u32, name: &str, scalar: &Scalar) {
        match scalar {
            Scalar::Varchar(text) => {
                self.terms
                    .entry(name.to_string())
                    .or_default()
                    .entry(analyze(text))
                    .or_default()
                    .insert(id);
            }
            _ => {
                if let Some(key) = PointKey::from_scalar(scalar) {
                    self.points
                        .entry(name.to_string())
                        .or_default()
                        .entry(key)
                        .or_default()
                        .insert(id);
                }
            }
        }
    }

    fn doc(&self, id: u32) -> &Arc<Document> {
        &self.docs[id as usize]
    }
}

/// Evaluate a predicate to the matching live document set.
fn eval(state: &ShardState, predicate: &IndexPredicate) -> RoaringBitmap {
    match predicate {
        IndexPredicate::All => state.live.clone(),
        IndexPredicate::TermEq { field, value } => match value {
            Scalar::Varchar(text) => state
                .terms
                .get(field)
                .and_then(|terms| terms.get(&analyze(text)))
                .cloned()
                .unwrap_or_default(),
            numeric => {
                let candidates = PointKey::from_scalar(numeric)
                    .and_then(|key| state.points.get(field).and_then(|points| points.get(&key)))
                    .cloned()
                    .unwrap_or_default();
                // the point key widens to f64; confirm equality on the
                // stored scalar
                candidates
                    .iter()
                    .filter(|id| {
                        state
                            .doc(*id)
                            .scalar(field)
                            .and_then(|s| s.compare(numeric))
                            == Some(Ordering::Equal)
                    })
                    .collect()
            }
        },
        IndexPredicate::Range { field, lo, hi } => {
            if range_is_empty(lo, hi) {
                return RoaringBitmap::new();
            }
            let Some(points) = state.points.get(field) else {
                return RoaringBitmap::new();
            };
            let (Some(lo_key), Some(hi_key)) = (encode_bound(lo), encode_bound(hi)) else {
                return RoaringBitmap::new();
            };
            let mut candidates = RoaringBitmap::new();
            for (_, ids) in points.range((lo_key, hi_key)) {
                candidates |= ids;
            }
            candidates
                .iter()
                .filter(|id| {
                    state
                        .doc(*id)
                        .scalar(field)
                        .is_some_and(|s| in_bounds(&s, lo, hi))
                })
                .collect()
        }
        IndexPredicate::And(parts) => {
            let mut iter = parts.iter();
            let Some(first) = iter.next() else {
                return state.live.clone();
            };
            let mut hits = eval(state, first);
            for part in iter {
                if hits.is_empty() {
                    break;
                }
                hits &= eval(state, part);
            }
            hits
        }
        IndexPredicate::Or(parts) => {
            let mut hits = RoaringBitmap::new();
            for part in parts {
                hits |= eval(state, part);
            }
            hits
        }
        IndexPredicate::Not(inner) => &state.live - &eval(state, inner),
    }
}

// The f64 widening can make an encoded bound imprecise for extreme
// integers; the per-document refinement keeps results exact.
fn encode_bound(bound: &RangeBound) -> Option<Bound<PointKey>> {
    match bound {
        RangeBound::Unbounded => Some(Bound::Unbounded),
        RangeBound::Inclusive(scalar) => PointKey::from_scalar(scalar).map(Bound::Included),
        RangeBound::Exclusive(scalar) => PointKey::from_scalar(scalar).map(Bound::Excluded),
    }
}

// `BTreeMap::range` panics on inverted bounds, so reversed or degenerate
// exclusive ranges short-circuit to the empty set first.
fn range_is_empty(lo: &RangeBound, hi: &RangeBound) -> bool {
    let (RangeBound::Inclusive(a) | RangeBound::Exclusive(a)) = lo else {
        return false;
    };
    let (RangeBound::Inclusive(b) | RangeBound::Exclusive(b)) = hi else {
        return false;
    };
    match a.compare(b) {
        Some(Ordering::Greater) | None => true,
        Some(Ordering::Equal) => {
            matches!(lo, RangeBound::Exclusive(_)) || matches!(hi, RangeBound::Exclusive(_))
        }
        Some(Ordering::Less) => false,
    }
}

fn in_bounds(scalar: &Scalar, lo: &RangeBound, hi: &RangeBound) -> bool {
    let lo_ok = match lo {
        RangeBound::Unbounded => true,
        RangeBound::Inclusive(b) => matches!(
            scalar.compare(b),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        RangeBound::Exclusive(b) => matches!(scalar.compare(b), Some(Ordering::Greater)),
    };
    let hi_ok = match hi {
        RangeBound::Unbounded => true,
        RangeBound::Inclusive(b) => matches!(
            scalar.compare(b),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        RangeBound::Exclusive(b) => matches!(scalar.compare(b), Some(Ordering::Less)),
    };
    lo_ok && hi_ok
}

/// Result of a shard query: reconstructed records plus the number of
/// documents skipped because they could not be reconstructed.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub records: Vec<Record>,
    pub skipped: u64,
}

struct SegmentWriter {
    path: PathBuf,
}

impl SegmentWriter {
    fn append(&mut self, doc: &Document) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for doc in docs {
                let mut line = serde_json::to_vec(doc.as_ref())?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Append-only structured record store for one time-bounded shard.
#[derive(Debug)]
pub struct ShardIndex {
    metric: String,
    state: RwLock<Arc<ShardState>>,
    segment: Arc<Mutex<SegmentWriter>>,
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("path", &self.path)
            .finish()
    }
}

impl ShardIndex {
    /// Open (or create) the shard index stored under `dir`, replaying the
    /// segment into postings.
    pub fn open(dir: impl Into<PathBuf>, metric: &str) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(SEGMENT_FILE);

        let mut docs = Vec::new();
        if path.exists() {
            for (line_no, line) in fs::read_to_string(&path)?.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Document>(line) {
                    Ok(doc) => docs.push(Arc::new(doc)),
                    Err(err) => {
                        // a torn tail write loses at most the last record
                        warn!(
                            metric,
                            line = line_no + 1,
                            %err,
                            "stopping segment replay at corrupt entry"
                        );
                        break;
                    }
                }
            }
        }
        debug!(metric, documents = docs.len(), path = %path.display(), "shard opened");

        Ok(Arc::new(Self {
            metric: metric.to_string(),
            state: RwLock::new(Arc::new(ShardState::rebuild(docs))),
            segment: Arc::new(Mutex::new(SegmentWriter { path })),
        }))
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    fn snapshot(&self) -> Arc<ShardState> {
        self.state.read().clone()
    }

    fn install(&self, state: ShardState) {
        *self.state.write() = Arc::new(state);
    }

    /// Acquire the scoped writer token. At most one writer is in flight
    /// per shard; the token releases on every exit path when dropped.
    pub async fn writer(self: &Arc<Self>) -> ShardWriter {
        ShardWriter {
            index: self.clone(),
            segment: self.segment.clone().lock_owned().await,
        }
    }

    /// Number of live documents.
    pub fn count(&self) -> u64 {
        self.snapshot().live.len()
    }

    /// Count the documents matching a predicate, capped by `limit`.
    pub fn count_query(&self, predicate: &IndexPredicate, limit: Option<u64>) -> u64 {
        let hits = eval(&self.snapshot(), predicate).len();
        match limit {
            Some(limit) => hits.min(limit),
            None => hits,
        }
    }

    /// Run a predicate query, reconstructing records through the schema.
    pub fn query(
        &self,
        schema: &Schema,
        predicate: &IndexPredicate,
        projection: &Projection,
        limit: Option<usize>,
        sort: Option<&OrderClause>,
    ) -> QueryOutcome {
        let state = self.snapshot();
        let hits = eval(&state, predicate);
        let mut docs: Vec<&Arc<Document>> = hits.iter().map(|id| state.doc(id)).collect();

        if let Some(clause) = sort {
            docs.sort_by(|a, b| compare_docs(a.as_ref(), b.as_ref(), clause));
        }
        if let Some(limit) = limit {
            docs.truncate(limit);
        }

        let mut outcome = QueryOutcome::default();
        for doc in docs {
            match reconstruct(schema, doc, projection) {
                Some(record) => outcome.records.push(record),
                None => outcome.skipped += 1,
            }
        }
        outcome
    }

    /// All live records of the shard.
    pub fn all(&self, schema: &Schema) -> QueryOutcome {
        self.query(schema, &IndexPredicate::All, &Projection::AllFields, None, None)
    }

    /// One synthetic record per group: the group key as a dimension, the
    /// aggregate as value, and the group size on the reserved count field.
    ///
    /// For `avg` the partial carries the group sum as value; the caller
    /// finalises the quotient from the count channel.
    pub fn grouped_aggregation(
        &self,
        schema: &Schema,
        predicate: &IndexPredicate,
        group_field: &str,
        aggregator: Aggregation,
        limit: Option<usize>,
        sort: Option<&OrderClause>,
    ) -> Vec<Record> {
        let state = self.snapshot();
        let hits = eval(&state, predicate);

        let declared = schema.field(group_field);
        let mut groups: BTreeMap<String, GroupAcc> = BTreeMap::new();
        for id in hits.iter() {
            let doc = state.doc(id);
            // sparse rows without the group field join no group
            let Some(key) = doc.fields.get(group_field) else {
                continue;
            };
            if let Some(field) = declared {
                if !field.index_type.accepts(key) {
                    continue;
                }
            }
            groups
                .entry(key.key_repr())
                .or_insert_with(|| GroupAcc::new(key.clone()))
                .add(doc);
        }

        let mut records: Vec<Record> = groups
            .into_values()
            .map(|acc| acc.finish(group_field, aggregator))
            .collect();
        if let Some(clause) = sort {
            records.sort_by(|a, b| compare_records(a, b, clause));
        }
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        records
    }
}

/// Scoped writer token for one shard. Holding it guarantees exclusive
/// write access; dropping it releases the shard on every exit path.
#[derive(Debug)]
pub struct ShardWriter {
    index: Arc<ShardIndex>,
    segment: OwnedMutexGuard<SegmentWriter>,
}

impl ShardWriter {
    /// Validate and append one record; returns its sequence number.
    pub fn write(&mut self, schema: &Schema, record: &Record) -> Result<u64> {
        materialize(schema, record)?;
        let state = self.index.snapshot();
        let seq = state.next_seq;
        let doc = Document::from_record(seq, record);
        self.segment.append(&doc)?;

        let mut next = ShardState::clone(&state);
        next.append(Arc::new(doc));
        self.index.install(next);
        Ok(seq)
    }

    /// Delete all documents carrying exactly this timestamp and merge the
    /// deletes out of the segment.
    pub fn delete_by_timestamp(&mut self, timestamp: i64) -> Result<u64> {
        let state = self.index.snapshot();
        let keep: Vec<Arc<Document>> = state
            .docs
            .iter()
            .filter(|doc| doc.timestamp != timestamp)
            .cloned()
            .collect();
        let removed = state.docs.len() as u64 - keep.len() as u64;
        self.commit_rewrite(&state, keep)?;
        Ok(removed)
    }

    /// Delete every document matching the predicate.
    pub fn delete_by_query(&mut self, predicate: &IndexPredicate) -> Result<u64> {
        let state = self.index.snapshot();
        let hits = eval(&state, predicate);
        if hits.is_empty() {
            return Ok(0);
        }
        let keep: Vec<Arc<Document>> = state
            .docs
            .iter()
            .enumerate()
            .filter(|(id, _)| !hits.contains(*id as u32))
            .map(|(_, doc)| doc.clone())
            .collect();
        self.commit_rewrite(&state, keep)?;
        Ok(hits.len())
    }

    fn commit_rewrite(&mut self, old: &ShardState, keep: Vec<Arc<Document>>) -> Result<()> {
        self.segment.rewrite(&keep)?;
        let mut state = ShardState::rebuild(keep);
        state.next_seq = state.next_seq.max(old.next_seq);
        self.index.install(state);
        Ok(())
    }
}

struct GroupAcc {
    key: Scalar,
    count: u64,
    sum_int: i64,
    sum_float: f64,
    saw_float: bool,
    min: Option<Scalar>,
    max: Option<Scalar>,
    last_timestamp: i64,
}

impl GroupAcc {
    fn new(key: Scalar) -> Self {
        Self {
            key,
            count: 0,
            sum_int: 0,
            sum_float: 0.0,
            saw_float: false,
            min: None,
            max: None,
            last_timestamp: i64::MIN,
        }
    }

    fn add(&mut self, doc: &Document) {
        self.count += 1;
        self.last_timestamp = self.last_timestamp.max(doc.timestamp);
        match &doc.value {
            Scalar::BigInt(v) => self.sum_int = self.sum_int.wrapping_add(*v),
            Scalar::Decimal(v) => {
                self.sum_float += v;
                self.saw_float = true;
            }
            Scalar::Varchar(_) => {}
        }
        let better_min = self
            .min
            .as_ref()
            .map_or(true, |m| doc.value.compare(m) == Some(Ordering::Less));
        if better_min {
            self.min = Some(doc.value.clone());
        }
        let better_max = self
            .max
            .as_ref()
            .map_or(true, |m| doc.value.compare(m) == Some(Ordering::Greater));
        if better_max {
            self.max = Some(doc.value.clone());
        }
    }

    fn sum(&self) -> Scalar {
        if self.saw_float {
            Scalar::Decimal(self.sum_float + self.sum_int as f64)
        } else {
            Scalar::BigInt(self.sum_int)
        }
    }

    fn finish(self, group_field: &str, aggregator: Aggregation) -> Record {
        let value = match aggregator {
            Aggregation::Sum | Aggregation::Avg => self.sum(),
            Aggregation::Count => Scalar::BigInt(self.count as i64),
            Aggregation::Min => self.min.clone().unwrap_or(Scalar::BigInt(0)),
            Aggregation::Max => self.max.clone().unwrap_or(Scalar::BigInt(0)),
        };
        let mut record = Record::new(self.last_timestamp, value);
        record.dimensions.insert(group_field.to_string(), self.key);
        record
            .tags
            .insert(COUNT_FIELD.to_string(), Scalar::BigInt(self.count as i64));
        record
    }
}

fn compare_docs(a: &Document, b: &Document, clause: &OrderClause) -> Ordering {
    let ordering = compare_optional(a.scalar(&clause.field), b.scalar(&clause.field))
        .then_with(|| a.seq.cmp(&b.seq));
    if clause.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

/// Sort records by a field, resolving reserved names; absent values sort
/// last regardless of direction.
pub fn compare_records(a: &Record, b: &Record, clause: &OrderClause) -> Ordering {
    let left = a.sort_value(&clause.field);
    let right = b.sort_value(&clause.field);
    match (&left, &right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(_), Some(_)) => {
            let ordering = compare_optional(left, right);
            if clause.descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

fn compare_optional(a: Option<Scalar>, b: Option<Scalar>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(&b).unwrap_or(Ordering::Equal),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
    }
}

fn reconstruct(schema: &Schema, doc: &Document, projection: &Projection) -> Option<Record> {
    let mut record = Record::new(doc.timestamp, doc.value.clone());
    for field in schema.fields_of_class(FieldClass::Dimension) {
        if !projected(projection, &field.name) {
            continue;
        }
        if let Some(scalar) = doc.fields.get(&field.name) {
            if !field.index_type.accepts(scalar) {
                return None;
            }
            record
                .dimensions
                .insert(field.name.clone(), scalar.clone());
        }
    }
    for field in schema.fields_of_class(FieldClass::Tag) {
        if !projected(projection, &field.name) {
            continue;
        }
        if let Some(scalar) = doc.fields.get(&field.name) {
            if !field.index_type.accepts(scalar) {
                return None;
            }
            record.tags.insert(field.name.clone(), scalar.clone());
        }
    }
    Some(record)
}

fn projected(projection: &Projection, name: &str) -> bool {
    match projection {
        Projection::AllFields => true,
        Projection::Fields(fields) => fields
            .iter()
            .any(|f| f.name == name && f.aggregation.is_none()),
    }
}
