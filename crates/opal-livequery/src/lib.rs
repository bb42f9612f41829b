//! # Opal Live Queries
//!
//! The multiplexed live-query polling core of the Opal GraphQL engine.
//!
//! Many client subscriptions are multiplexed over a small number of
//! parameterized database queries:
//!
//! - Subscriptions sharing a `(source, role, query text)` triple share a
//!   **poller** — one dedicated worker task polling the database.
//! - Within a poller, subscriptions with identical resolved variables
//!   share a **cohort** — one row in the multiplexed result set.
//! - On each tick, all cohorts are batched into a handful of round-trips;
//!   each cohort's payload is hashed and pushed to its subscribers only
//!   when the hash changed. New subscribers always receive the first
//!   response.
//!
//! Only response *hashes* are retained between ticks, never payloads, so
//! memory stays bounded regardless of result sizes.
//!
//! ## Collaborator seams
//!
//! GraphQL parsing, SQL generation, permissions, and the client wire
//! protocol all live outside this crate, behind three traits:
//! [`SourceExecutor`] (the database), [`OnChange`] (delivery to one
//! client), and [`PostPollHook`] (per-tick telemetry).
//!
//! ## Example
//!
//! ```rust,ignore
//! let registry = LiveQueryRegistry::new(LiveQueryOptions::default(), executor);
//!
//! let id = registry
//!     .subscribe(key, query_hash, variables, subscriber)
//!     .await?;
//!
//! // ... later, when the client disconnects ...
//! registry.unsubscribe(&key, &variables, id.subscriber_id).await;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cohort;
pub mod dump;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod poll;
pub mod poller;
pub mod registry;
pub mod subscriber;

pub use cohort::{Cohort, CohortId, CohortMap, CohortSnapshot, CohortVariables};
pub use error::{DeliveryError, Error, Result, SourceError};
pub use hash::ResponseHash;
pub use metrics::{
    BatchExecutionDetails, BatchId, CohortExecutionDetails, LogPollHook, PollDetails,
    PostPollHook, SubscriberExecutionDetails,
};
pub use poll::{LiveQueryOptions, MultiplexedQuery, ParameterizedQueryHash, SourceExecutor};
pub use poller::{Poller, PollerId, PollerKey, PollerMap, RoleName, SourceName};
pub use registry::{LiveQueryId, LiveQueryRegistry};
pub use subscriber::{
    on_change_fn, LiveQueryResponse, OnChange, OperationName, RequestId, Subscriber, SubscriberId,
    SubscriberMetadata,
};
