//! HTTP/JSON endpoint
//!
//! Adapts external requests to coordinator commands and pipes the
//! replies back: record writes, metric initialisation, SQL execution and
//! the health probe.

use crate::error::{Error, Result};
use crate::guardian::NodeGuardian;
use crate::metadata::Location;
use crate::model::{Record, Scalar, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::schema::Schema;
use crate::statement::{self, InsertStatement, SqlStatement};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
struct ApiState {
    guardian: Arc<NodeGuardian>,
}

/// Build the endpoint router.
pub fn router(guardian: Arc<NodeGuardian>) -> Router {
    Router::new()
        .route("/api/v1/write", post(write))
        .route("/api/v1/init", post(init_metric))
        .route("/api/v1/sql", post(execute_sql))
        .route("/health", get(health))
        .with_state(ApiState { guardian })
}

/// Bind and serve the endpoint until the process stops.
pub async fn serve(guardian: Arc<NodeGuardian>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "endpoint listening");
    axum::serve(listener, router(guardian)).await?;
    Ok(())
}

/// One inbound record.
#[derive(Debug, Deserialize)]
struct WriteRequest {
    db: String,
    namespace: String,
    metric: String,
    /// Defaults to the server clock when omitted
    timestamp: Option<i64>,
    value: Scalar,
    #[serde(default)]
    dimensions: BTreeMap<String, Scalar>,
    #[serde(default)]
    tags: BTreeMap<String, Scalar>,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    ok: bool,
    metric: String,
    seq: u64,
    location: Location,
}

async fn write(State(state): State<ApiState>, Json(request): Json<WriteRequest>) -> Response {
    let record = Record {
        timestamp: request.timestamp.unwrap_or_else(now_millis),
        value: request.value,
        dimensions: request.dimensions,
        tags: request.tags,
    };
    let outcome = async {
        let context = state.guardian.namespace(&request.db, &request.namespace)?;
        context.write.map_input(&request.metric, record).await
    }
    .await;

    match outcome {
        Ok(mapped) => Json(WriteResponse {
            ok: true,
            metric: mapped.metric,
            seq: mapped.seq,
            location: mapped.location,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    db: String,
    namespace: String,
    metric: String,
    shard_interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    ok: bool,
    metric: String,
    shard_interval_ms: u64,
}

async fn init_metric(State(state): State<ApiState>, Json(request): Json<InitRequest>) -> Response {
    let outcome = state
        .guardian
        .namespace(&request.db, &request.namespace)
        .and_then(|context| {
            context
                .metadata
                .put_metric_info(&request.metric, request.shard_interval_ms)
        });
    match outcome {
        Ok(info) => Json(InitResponse {
            ok: true,
            metric: info.metric,
            shard_interval_ms: info.shard_interval_ms,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SqlRequest {
    db: String,
    namespace: String,
    query: String,
}

#[derive(Debug, Serialize)]
struct SqlResponse {
    records: Vec<Record>,
    rows: usize,
    /// Documents skipped during record reconstruction
    skipped: u64,
    execution_time_ms: u64,
}

async fn execute_sql(State(state): State<ApiState>, Json(request): Json<SqlRequest>) -> Response {
    let started = Instant::now();
    let outcome = dispatch_sql(&state, &request).await;
    match outcome {
        Ok((records, skipped)) => Json(SqlResponse {
            rows: records.len(),
            records,
            skipped,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn dispatch_sql(state: &ApiState, request: &SqlRequest) -> Result<(Vec<Record>, u64)> {
    let context = state.guardian.namespace(&request.db, &request.namespace)?;
    match statement::parse(&request.query)? {
        SqlStatement::Select(select) => {
            let result = context.read.execute_statement(select).await?;
            Ok((result.records, result.skipped))
        }
        SqlStatement::Insert(insert) => {
            let schema = context.schemas.get(&insert.metric);
            let record = record_from_insert(schema.as_deref(), &insert)?;
            context.write.map_input(&insert.metric, record).await?;
            Ok((Vec::new(), 0))
        }
        SqlStatement::Delete(delete) => {
            context.write.execute_delete_statement(delete).await?;
            Ok((Vec::new(), 0))
        }
        SqlStatement::Drop(drop) => {
            context.write.drop_metric(drop.metric).await?;
            Ok((Vec::new(), 0))
        }
    }
}

/// Map an INSERT column list to a record. Reserved columns feed the
/// record's timestamp and value; the rest follow the field class the
/// schema already declares, defaulting to dimensions for new fields.
fn record_from_insert(schema: Option<&Schema>, insert: &InsertStatement) -> Result<Record> {
    let timestamp = match insert.columns.get(TIMESTAMP_FIELD) {
        Some(scalar) => scalar
            .as_i64()
            .ok_or_else(|| Error::InvalidStatement("timestamp must be an integer".into()))?,
        None => now_millis(),
    };
    let value = insert
        .columns
        .get(VALUE_FIELD)
        .cloned()
        .ok_or_else(|| Error::InvalidStatement("INSERT requires a value column".into()))?;

    let mut record = Record::new(timestamp, value);
    for (name, scalar) in &insert.columns {
        if name == TIMESTAMP_FIELD || name == VALUE_FIELD {
            continue;
        }
        let is_tag = schema
            .and_then(|s| s.field(name))
            .map(|field| field.class == crate::model::FieldClass::Tag)
            .unwrap_or(false);
        if is_tag {
            record.tags.insert(name.clone(), scalar.clone());
        } else {
            record.dimensions.insert(name.clone(), scalar.clone());
        }
    }
    Ok(record)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    namespaces: usize,
    locations: usize,
    open_shards: usize,
}

async fn health(State(state): State<ApiState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        node_id: state.guardian.config().node_id.clone(),
        namespaces: state.guardian.namespace_count(),
        locations: state.guardian.location_count(),
        open_shards: state.guardian.open_shard_count(),
    })
    .into_response()
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::MetricNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidStatement(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
        Error::SchemaConflict { .. } | Error::IntervalFrozen { .. } => StatusCode::CONFLICT,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::UnsupportedDistributedAvg => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
