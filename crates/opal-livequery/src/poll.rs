//! The poll tick and the poller worker.
//!
//! Each poller's worker task runs [`poll_query`] repeatedly:
//!
//! 1. **Snapshot** all cohorts (promoting new subscribers to existing).
//! 2. **Partition** the snapshots into batches of `batch_size`.
//! 3. **Execute** the multiplexed query once per batch, concurrently.
//! 4. **Diff** each cohort's payload hash against the last pushed hash.
//! 5. **Push** to the affected subscribers, concurrently.
//! 6. **Report** the tick as [`PollDetails`] to the post-poll hook.
//!
//! The worker is immortal: any error or panic escaping a tick is logged
//! and the loop continues after the usual sleep. Losing a worker
//! permanently would silently starve its subscribers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::FutureExt;
use fxhash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::cohort::{CohortId, CohortSnapshot, CohortVariables};
use crate::error::SourceError;
use crate::hash::ResponseHash;
use crate::metrics::{
    duration_ms, BatchExecutionDetails, BatchId, CohortExecutionDetails, PollDetails,
    PostPollHook, SubscriberExecutionDetails,
};
use crate::poller::{Poller, PollerId, RoleName, SourceName};
use crate::subscriber::{LiveQueryResponse, Subscriber};

// ---------------------------------------------------------------------------
// LiveQueryOptions
// ---------------------------------------------------------------------------

/// Poll cadence configuration, bound once per poller at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveQueryOptions {
    /// Number of cohorts executed per database round-trip. Positive.
    pub batch_size: usize,
    /// Sleep between the start of a tick and the start of the next.
    #[serde(serialize_with = "duration_ms")]
    pub refetch_interval: Duration,
}

impl LiveQueryOptions {
    /// Returns a copy with out-of-range values clamped to usable ones.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            refetch_interval: self.refetch_interval,
        }
    }
}

impl Default for LiveQueryOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            refetch_interval: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// MultiplexedQuery / ParameterizedQueryHash
// ---------------------------------------------------------------------------

/// A single parameterized statement that, given a list of
/// `(cohort id, variables)` pairs, returns one row per cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MultiplexedQuery(String);

impl MultiplexedQuery {
    /// Wraps the generated SQL text.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    /// The SQL text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MultiplexedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream-computed hash identifying the parameterized query, carried
/// through to diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ParameterizedQueryHash(pub String);

impl std::fmt::Display for ParameterizedQueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SourceExecutor
// ---------------------------------------------------------------------------

/// The database integration boundary.
///
/// Runs the multiplexed query with every cohort's variables injected and
/// returns one `(cohort id, payload)` row per cohort. Fewer rows than
/// cohorts is normal (rows filtered out); the core treats execution as a
/// black box and measures its wall-clock time.
#[async_trait]
pub trait SourceExecutor: Send + Sync {
    /// Executes one batch against the source.
    async fn run_multiplexed_query(
        &self,
        query: &MultiplexedQuery,
        cohorts: &[(CohortId, CohortVariables)],
    ) -> Result<Vec<(CohortId, Bytes)>, SourceError>;
}

// ---------------------------------------------------------------------------
// PollContext
// ---------------------------------------------------------------------------

/// Everything a poller's worker needs, bound once at spawn.
pub(crate) struct PollContext {
    pub(crate) poller_id: PollerId,
    pub(crate) options: LiveQueryOptions,
    pub(crate) source: SourceName,
    pub(crate) role: RoleName,
    pub(crate) query: MultiplexedQuery,
    pub(crate) query_hash: ParameterizedQueryHash,
    pub(crate) poller: Arc<Poller>,
    pub(crate) executor: Arc<dyn SourceExecutor>,
    pub(crate) hook: Arc<dyn PostPollHook>,
}

// ---------------------------------------------------------------------------
// Poll tick
// ---------------------------------------------------------------------------

/// One per-cohort unit of work within a batch.
struct CohortOp<'a> {
    result: Result<Bytes, SourceError>,
    new_hash: Option<ResponseHash>,
    response_size: Option<usize>,
    snapshot: &'a CohortSnapshot,
}

/// Runs one complete snapshot-execute-push cycle and reports it.
pub(crate) async fn poll_query(ctx: &PollContext) -> PollDetails {
    let tick_started = Instant::now();

    // Snapshot phase: list the cohorts at one logical instant, then
    // promote each cohort's new subscribers. Promotions across cohorts are
    // not jointly atomic; cohorts are independent.
    let snapshot_started = Instant::now();
    let snapshots: Vec<CohortSnapshot> = ctx
        .poller
        .cohorts()
        .entries()
        .into_iter()
        .map(|(variables, cohort)| cohort.snapshot_and_promote(&variables))
        .collect();
    let snapshot_time = snapshot_started.elapsed();

    // Partition into batches and execute them concurrently.
    let batch_size = ctx.options.batch_size.max(1);
    let batches = future::join_all(
        snapshots
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| execute_batch(ctx, BatchId(index + 1), chunk)),
    )
    .await;

    let details = PollDetails {
        poller_id: ctx.poller_id,
        source: ctx.source.clone(),
        role: ctx.role.clone(),
        snapshot_time,
        batches,
        total_time: tick_started.elapsed(),
        generated_sql: ctx.query.as_str().to_string(),
        live_query_options: ctx.options,
        parameterized_query_hash: ctx.query_hash.clone(),
    };

    ctx.poller.record_tick();
    ctx.hook.on_poll(&details);
    details
}

/// Executes one batch: run the multiplexed query, map rows back to
/// snapshots, then push every cohort's outcome concurrently.
async fn execute_batch(
    ctx: &PollContext,
    batch_id: BatchId,
    snapshots: &[CohortSnapshot],
) -> BatchExecutionDetails {
    let cohort_variables: Vec<(CohortId, CohortVariables)> = snapshots
        .iter()
        .map(|s| (s.cohort_id(), s.variables.clone()))
        .collect();

    let execution_started = Instant::now();
    let result = ctx
        .executor
        .run_multiplexed_query(&ctx.query, &cohort_variables)
        .await;
    let pg_execution_time = execution_started.elapsed();

    let mut ops: Vec<CohortOp<'_>> = Vec::with_capacity(snapshots.len());
    let mut batch_response_size_bytes = None;
    match result {
        Err(error) => {
            // The whole batch failed: every cohort receives the error and
            // resets its hash so the next success pushes unconditionally.
            tracing::warn!(
                poller_id = %ctx.poller_id,
                batch_id = %batch_id,
                error = %error,
                "Multiplexed query failed"
            );
            for snapshot in snapshots {
                ops.push(CohortOp {
                    result: Err(error.clone()),
                    new_hash: None,
                    response_size: None,
                    snapshot,
                });
            }
        }
        Ok(rows) => {
            let by_id: FxHashMap<CohortId, &CohortSnapshot> =
                snapshots.iter().map(|s| (s.cohort_id(), s)).collect();
            let mut total = 0usize;
            for (cohort_id, payload) in rows {
                // A row for a cohort we did not ask about is an internal
                // inconsistency; skip it. Cohorts with no row at all
                // simply receive nothing this tick.
                let Some(snapshot) = by_id.get(&cohort_id).copied() else {
                    tracing::error!(
                        poller_id = %ctx.poller_id,
                        cohort_id = %cohort_id,
                        "Multiplexed response for a cohort not in the batch"
                    );
                    continue;
                };
                total += payload.len();
                ops.push(CohortOp {
                    new_hash: Some(ResponseHash::of(&payload)),
                    response_size: Some(payload.len()),
                    result: Ok(payload),
                    snapshot,
                });
            }
            batch_response_size_bytes = Some(total);
        }
    }

    let push_started = Instant::now();
    let cohorts = future::join_all(
        ops.into_iter()
            .map(|op| push_to_cohort(op, pg_execution_time, batch_id)),
    )
    .await;
    let push_time = push_started.elapsed();

    BatchExecutionDetails {
        pg_execution_time,
        push_time,
        batch_id,
        cohorts,
        batch_response_size_bytes,
    }
}

/// Pushes one cohort's outcome to the subscribers that need it.
///
/// Existing subscribers are notified only when the response hash changed
/// or the batch errored; new subscribers are always notified. Error
/// results reset the hash cell so the next success pushes even if it
/// equals a pre-error payload.
async fn push_to_cohort(
    op: CohortOp<'_>,
    execution_time: Duration,
    batch_id: BatchId,
) -> CohortExecutionDetails {
    let CohortOp {
        result,
        new_hash,
        response_size,
        snapshot,
    } = op;

    let previous_hash = snapshot.current_hash();
    let push_to_existing = result.is_err() || new_hash != previous_hash;

    let (notified, ignored): (Vec<&Arc<Subscriber>>, Vec<&Arc<Subscriber>>) = if push_to_existing {
        // Only fully-computed hashes are ever written; an interrupted push
        // can leave at most a stale value, never a torn one.
        snapshot.store_hash(new_hash);
        (
            snapshot
                .newly_joined
                .iter()
                .chain(snapshot.existing.iter())
                .collect(),
            Vec::new(),
        )
    } else {
        (
            snapshot.newly_joined.iter().collect(),
            snapshot.existing.iter().collect(),
        )
    };

    let pushed_to = subscriber_details(&notified);
    let ignored_details = subscriber_details(&ignored);

    // Fan out concurrently; one task per subscriber isolates slow or
    // failing callbacks from their siblings and from the tick.
    let response = LiveQueryResponse {
        result,
        execution_time,
    };
    let mut deliveries = JoinSet::new();
    for subscriber in notified {
        let subscriber = Arc::clone(subscriber);
        let response = response.clone();
        deliveries.spawn(async move {
            if let Err(error) = subscriber.deliver(response).await {
                tracing::warn!(
                    subscriber_id = %subscriber.id(),
                    error = %error,
                    "Subscriber delivery failed"
                );
            }
        });
    }
    while let Some(joined) = deliveries.join_next().await {
        if let Err(error) = joined {
            tracing::warn!(error = %error, "Subscriber delivery task failed");
        }
    }

    CohortExecutionDetails {
        cohort_id: snapshot.cohort_id(),
        variables: snapshot.variables.clone(),
        response_size,
        pushed_to,
        ignored: ignored_details,
        batch_id,
    }
}

fn subscriber_details(subscribers: &[&Arc<Subscriber>]) -> Vec<SubscriberExecutionDetails> {
    subscribers
        .iter()
        .map(|s| SubscriberExecutionDetails {
            subscriber_id: s.id(),
            subscriber_metadata: s.metadata().clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Spawns the dedicated worker task for one poller.
pub(crate) fn spawn_poller_worker(ctx: PollContext, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run_poller(ctx, stop))
}

/// The worker loop: tick, then sleep out the remainder of the refetch
/// interval. A tick longer than the interval rolls straight into the next
/// one; missed ticks are not queued.
async fn run_poller(ctx: PollContext, mut stop: watch::Receiver<bool>) {
    tracing::info!(
        poller_id = %ctx.poller_id,
        source = %ctx.source,
        role = %ctx.role,
        "Poller worker started"
    );

    loop {
        if *stop.borrow() {
            break;
        }

        let tick_started = Instant::now();
        if let Err(panic) = AssertUnwindSafe(poll_query(&ctx)).catch_unwind().await {
            tracing::error!(
                poller_id = %ctx.poller_id,
                panic = %panic_message(&panic),
                "Poll tick panicked"
            );
        }

        let elapsed = tick_started.elapsed();
        if elapsed < ctx.options.refetch_interval {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Stop sender gone; nothing can wake us again.
                        break;
                    }
                }
                () = tokio::time::sleep(ctx.options.refetch_interval - elapsed) => {}
            }
        }
    }

    tracing::info!(
        poller_id = %ctx.poller_id,
        ticks = ctx.poller.tick_count(),
        "Poller worker stopped"
    );
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
