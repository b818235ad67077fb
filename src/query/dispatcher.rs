//! Concurrent execution of a batch of queries.
//!
//! Every query runs in its own task under a child of the batch context,
//! bounded by a deadline equal to its time-range span. An empty or reversed
//! range leaves no time at all, so such a query expires before it can take a
//! connection. Per-query failures
//! (bad template, rejected SQL) become error entries for that query only.
//! A failed connection acquisition aborts the whole batch: the first such
//! error is kept, later ones are dropped, the batch context is cancelled and
//! the batch returns that error with no results, including the results of
//! queries that already finished.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DataSourceError, QueryError};
use crate::metrics;
use crate::models::{BatchResult, QueryRequest, QueryResponse};
use crate::pool::ConnectionPool;
use crate::query::context::QueryContext;
use crate::query::executor;
use crate::query::frame::{ColumnBuilder, Frame};
use crate::query::template;
use crate::Result;

/// Shared cancellation plus a single-write error slot. The first error
/// recorded wins and cancels the group.
struct AbortGroup {
    ctx: QueryContext,
    first_error: Mutex<Option<DataSourceError>>,
}

impl AbortGroup {
    fn new(ctx: QueryContext) -> Self {
        Self {
            ctx,
            first_error: Mutex::new(None),
        }
    }

    fn abort(&self, err: DataSourceError) {
        let mut slot = self.first_error.lock();
        if slot.is_some() {
            debug!("Dropping error after batch abort: {}", err);
            return;
        }
        warn!("Aborting batch: {}", err);
        *slot = Some(err);
        drop(slot);
        self.ctx.cancel();
    }

    fn take_error(&self) -> Option<DataSourceError> {
        self.first_error.lock().take()
    }
}

pub struct QueryDispatcher<P> {
    pool: Arc<P>,
    builder: Arc<ColumnBuilder>,
}

impl<P> Clone for QueryDispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            builder: self.builder.clone(),
        }
    }
}

impl<P: ConnectionPool> QueryDispatcher<P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self::with_builder(pool, ColumnBuilder::default())
    }

    pub fn with_builder(pool: Arc<P>, builder: ColumnBuilder) -> Self {
        Self {
            pool,
            builder: Arc::new(builder),
        }
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    pub async fn dispatch(&self, queries: Vec<QueryRequest>) -> Result<BatchResult> {
        self.dispatch_in(&QueryContext::background(), queries).await
    }

    /// Execute `queries` concurrently under `parent`. Cancelling `parent`
    /// cancels every query still waiting for a connection or running.
    pub async fn dispatch_in(
        &self,
        parent: &QueryContext,
        queries: Vec<QueryRequest>,
    ) -> Result<BatchResult> {
        let batch_id = Uuid::new_v4();
        let _timer = metrics::BATCH_DURATION.start_timer();
        debug!("Dispatching batch {} with {} queries", batch_id, queries.len());

        let batch = parent.child(None);
        // Tasks still running when this future is dropped are cancelled.
        let _cancel_on_drop = batch.token().clone().drop_guard();
        let group = Arc::new(AbortGroup::new(batch.clone()));
        let results: Arc<Mutex<BatchResult>> =
            Arc::new(Mutex::new(BatchResult::with_capacity(queries.len())));

        let tasks: Vec<_> = queries
            .into_iter()
            .map(|query| {
                let ref_id = query.ref_id.clone();
                let ctx = batch.child(Some(query.time_range.duration()));
                let task = tokio::spawn(run_query(
                    query,
                    ctx,
                    self.pool.clone(),
                    self.builder.clone(),
                    group.clone(),
                    results.clone(),
                ));
                (ref_id, task)
            })
            .collect();

        let (ref_ids, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        for (ref_id, outcome) in ref_ids.into_iter().zip(joined) {
            if let Err(e) = outcome {
                error!("Query task {} did not finish: {}", ref_id, e);
                let response = QueryError::Execution(e.to_string()).into();
                results.lock().insert(ref_id, response);
            }
        }

        if let Some(err) = group.take_error() {
            metrics::record_batch_abort();
            return Err(err);
        }

        let results = std::mem::take(&mut *results.lock());
        debug!("Batch {} finished with {} results", batch_id, results.len());
        Ok(results)
    }
}

async fn run_query<P: ConnectionPool>(
    query: QueryRequest,
    ctx: QueryContext,
    pool: Arc<P>,
    builder: Arc<ColumnBuilder>,
    group: Arc<AbortGroup>,
    results: Arc<Mutex<BatchResult>>,
) {
    info!(ref_id = %query.ref_id, "Processing query");
    metrics::record_query();
    let _timer = metrics::QUERY_DURATION.start_timer();

    let response = match process(&query, &ctx, pool.as_ref(), &builder).await {
        Ok(frame) => QueryResponse::Frame(frame),
        Err(QueryError::Acquisition(source)) => {
            group.abort(DataSourceError::Acquisition {
                ref_id: query.ref_id,
                source,
            });
            return;
        }
        Err(err) => {
            metrics::record_query_error(err.code());
            err.into()
        }
    };

    results.lock().insert(query.ref_id, response);
}

async fn process<P: ConnectionPool>(
    query: &QueryRequest,
    ctx: &QueryContext,
    pool: &P,
    builder: &ColumnBuilder,
) -> std::result::Result<Frame, QueryError> {
    let resolved = template::resolve_request(query).map_err(|e| {
        error!(ref_id = %query.ref_id, error = %e, "Failed to parse query model");
        e
    })?;

    let rows = executor::execute(ctx, pool, &resolved.text)
        .await
        .map_err(|e| {
            if !matches!(e, QueryError::Acquisition(_)) {
                error!(
                    ref_id = %query.ref_id,
                    query = %resolved.text,
                    error = %e,
                    "Query execution failed"
                );
            }
            e
        })?;

    Ok(builder.build(&rows, &resolved.text, &query.ref_id))
}
