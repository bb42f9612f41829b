//! Per-tick poll telemetry.
//!
//! Every tick assembles one [`PollDetails`] report and hands it to the
//! registered [`PostPollHook`]. The serialized schema is stable: external
//! consumers (logging, metrics pipelines) parse it.
//!
//! Durations serialize as fractional milliseconds.

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::cohort::{CohortId, CohortVariables};
use crate::poll::{LiveQueryOptions, ParameterizedQueryHash};
use crate::poller::{PollerId, RoleName, SourceName};
use crate::subscriber::{SubscriberId, SubscriberMetadata};

/// Serializes a duration as fractional milliseconds.
pub(crate) fn duration_ms<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1_000.0)
}

// ---------------------------------------------------------------------------
// BatchId
// ---------------------------------------------------------------------------

/// Position of a batch within one tick (1-based). Not stable across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BatchId(pub usize);

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Execution details
// ---------------------------------------------------------------------------

/// One subscriber as reported in a tick.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberExecutionDetails {
    /// The subscriber id.
    pub subscriber_id: SubscriberId,
    /// The transport-supplied metadata, passed through unchanged.
    pub subscriber_metadata: SubscriberMetadata,
}

/// One cohort's outcome within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct CohortExecutionDetails {
    /// The cohort id.
    pub cohort_id: CohortId,
    /// The cohort's resolved variables.
    pub variables: CohortVariables,
    /// Size in bytes of the cohort's payload; `None` on batch error.
    pub response_size: Option<usize>,
    /// Subscribers the response was pushed to.
    pub pushed_to: Vec<SubscriberExecutionDetails>,
    /// Subscribers skipped because the response hash was unchanged.
    pub ignored: Vec<SubscriberExecutionDetails>,
    /// The batch this cohort was executed in.
    pub batch_id: BatchId,
}

/// One batch's outcome within a tick.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExecutionDetails {
    /// Wall-clock duration of the database round-trip.
    #[serde(serialize_with = "duration_ms")]
    pub pg_execution_time: Duration,
    /// Wall-clock duration of the push fan-out.
    #[serde(serialize_with = "duration_ms")]
    pub push_time: Duration,
    /// Position of this batch within the tick.
    pub batch_id: BatchId,
    /// Per-cohort outcomes.
    pub cohorts: Vec<CohortExecutionDetails>,
    /// Total payload bytes returned for the batch; `None` on batch error.
    pub batch_response_size_bytes: Option<usize>,
}

/// The per-tick report surfaced to the post-poll hook.
#[derive(Debug, Clone, Serialize)]
pub struct PollDetails {
    /// The reporting poller.
    pub poller_id: PollerId,
    /// The source the poller executes against.
    pub source: SourceName,
    /// The role the query was planned for.
    pub role: RoleName,
    /// Duration of the snapshot-and-promote phase.
    #[serde(serialize_with = "duration_ms")]
    pub snapshot_time: Duration,
    /// Per-batch outcomes, in batch-id order.
    pub batches: Vec<BatchExecutionDetails>,
    /// Duration of the whole tick.
    #[serde(serialize_with = "duration_ms")]
    pub total_time: Duration,
    /// The multiplexed SQL text (extended diagnostics).
    pub generated_sql: String,
    /// The options the poller was spawned with (extended diagnostics).
    pub live_query_options: LiveQueryOptions,
    /// Upstream hash of the parameterized query (extended diagnostics).
    pub parameterized_query_hash: ParameterizedQueryHash,
}

impl PollDetails {
    /// Total number of subscribers pushed to across all batches.
    #[must_use]
    pub fn pushed_count(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.cohorts)
            .map(|c| c.pushed_to.len())
            .sum()
    }

    /// Total number of subscribers skipped across all batches.
    #[must_use]
    pub fn ignored_count(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.cohorts)
            .map(|c| c.ignored.len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// PostPollHook
// ---------------------------------------------------------------------------

/// External consumer of per-tick telemetry.
///
/// Invoked by the worker at the end of every tick, after all pushes have
/// settled. Implementations must be cheap or hand off internally; the
/// worker calls them inline.
pub trait PostPollHook: Send + Sync {
    /// Consumes one tick's report.
    fn on_poll(&self, details: &PollDetails);
}

/// Default hook: emits the tick report through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPollHook;

impl PostPollHook for LogPollHook {
    fn on_poll(&self, details: &PollDetails) {
        tracing::debug!(
            poller_id = %details.poller_id,
            source = %details.source,
            role = %details.role,
            batches = details.batches.len(),
            pushed = details.pushed_count(),
            ignored = details.ignored_count(),
            snapshot_ms = details.snapshot_time.as_secs_f64() * 1_000.0,
            total_ms = details.total_time.as_secs_f64() * 1_000.0,
            "Live query poll"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
