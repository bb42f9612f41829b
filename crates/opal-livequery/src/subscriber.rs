//! Subscribers and the delivery boundary.
//!
//! A [`Subscriber`] is one client operation registered by the transport
//! layer: an opaque id, free-form metadata carried through to metrics, the
//! transport's request tags, and an [`OnChange`] callback that performs the
//! actual I/O back to the client.
//!
//! Callbacks cross the core/transport boundary: they are treated as
//! potentially slow and potentially failing. The push phase invokes them
//! concurrently and isolates failures from sibling subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeliveryError, SourceError};

// ---------------------------------------------------------------------------
// SubscriberId
// ---------------------------------------------------------------------------

/// Opaque unique subscriber identifier (128-bit random).
///
/// Immutable for the life of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SubscriberMetadata
// ---------------------------------------------------------------------------

/// Free-form JSON value supplied by the transport at registration.
///
/// Opaque to the core; carried through to [`PollDetails`](crate::metrics::PollDetails)
/// and the dump output unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberMetadata(serde_json::Value);

impl SubscriberMetadata {
    /// Wraps a transport-supplied value.
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// The underlying value.
    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// RequestId / OperationName
// ---------------------------------------------------------------------------

/// Transport-level request identifier, used for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GraphQL operation name of the subscription, if the client sent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationName(pub String);

impl std::fmt::Display for OperationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LiveQueryResponse
// ---------------------------------------------------------------------------

/// The value delivered to a subscriber on each push.
///
/// Either the serialized per-cohort payload or the execution error of the
/// batch the cohort was part of, plus the wall-clock execution time of that
/// batch.
#[derive(Debug, Clone)]
pub struct LiveQueryResponse {
    /// Serialized payload, or the batch execution error.
    pub result: Result<Bytes, SourceError>,
    /// Wall-clock duration of the batch's database round-trip.
    pub execution_time: Duration,
}

// ---------------------------------------------------------------------------
// OnChange
// ---------------------------------------------------------------------------

/// Delivery callback for one subscriber.
///
/// Invoked by the poller worker for every pushed response. Implementations
/// send the response to the client and must be reentrancy-safe; a returned
/// error is logged and does not affect sibling subscribers or the tick.
#[async_trait]
pub trait OnChange: Send + Sync {
    /// Delivers one response to the client.
    async fn on_change(&self, response: LiveQueryResponse) -> Result<(), DeliveryError>;
}

/// Adapter that wraps a closure into an [`OnChange`].
struct FnOnChange<F>(F);

#[async_trait]
impl<F> OnChange for FnOnChange<F>
where
    F: Fn(LiveQueryResponse) + Send + Sync,
{
    async fn on_change(&self, response: LiveQueryResponse) -> Result<(), DeliveryError> {
        (self.0)(response);
        Ok(())
    }
}

/// Wraps an infallible closure into an [`OnChange`] trait object.
pub fn on_change_fn<F>(f: F) -> Arc<dyn OnChange>
where
    F: Fn(LiveQueryResponse) + Send + Sync + 'static,
{
    Arc::new(FnOnChange(f))
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// One registered client operation.
///
/// Created by the transport, owned by exactly one cohort's subscriber map,
/// destroyed when the transport removes it.
pub struct Subscriber {
    id: SubscriberId,
    metadata: SubscriberMetadata,
    request_id: RequestId,
    operation_name: Option<OperationName>,
    on_change: Arc<dyn OnChange>,
}

impl Subscriber {
    /// Creates a subscriber with a fresh random id.
    #[must_use]
    pub fn new(
        metadata: SubscriberMetadata,
        request_id: RequestId,
        operation_name: Option<OperationName>,
        on_change: Arc<dyn OnChange>,
    ) -> Self {
        Self {
            id: SubscriberId::new(),
            metadata,
            request_id,
            operation_name,
            on_change,
        }
    }

    /// The subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The transport-supplied metadata.
    #[must_use]
    pub fn metadata(&self) -> &SubscriberMetadata {
        &self.metadata
    }

    /// The transport request id.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The GraphQL operation name, if any.
    #[must_use]
    pub fn operation_name(&self) -> Option<&OperationName> {
        self.operation_name.as_ref()
    }

    /// Delivers one response through the subscriber's callback.
    pub async fn deliver(&self, response: LiveQueryResponse) -> Result<(), DeliveryError> {
        self.on_change.on_change(response).await
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("operation_name", &self.operation_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SubscriberMap
// ---------------------------------------------------------------------------

/// Keyed map of subscribers.
///
/// Plain data: atomicity is supplied by the enclosing cohort lock, which
/// covers every mutation and snapshot of the two maps together.
#[derive(Default)]
pub struct SubscriberMap {
    entries: FxHashMap<SubscriberId, Arc<Subscriber>>,
}

impl SubscriberMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a subscriber, returning the previous entry for the same id.
    pub fn insert(&mut self, subscriber: Arc<Subscriber>) -> Option<Arc<Subscriber>> {
        self.entries.insert(subscriber.id(), subscriber)
    }

    /// Removes a subscriber by id.
    pub fn remove(&mut self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.entries.remove(&id)
    }

    /// Whether the map contains the given id.
    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of subscribers in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the subscribers.
    pub fn values(&self) -> impl Iterator<Item = &Arc<Subscriber>> {
        self.entries.values()
    }

    /// Moves every entry out of the map.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Subscriber>> + '_ {
        self.entries.drain().map(|(_, s)| s)
    }
}

impl std::fmt::Debug for SubscriberMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberMap")
            .field("len", &self.entries.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
