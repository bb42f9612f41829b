//! Cohorts — subscribers grouped by identical resolved variables.
//!
//! Within a poller, every subscriber whose resolved variable bundle
//! ([`CohortVariables`]) is structurally equal shares one [`Cohort`]. The
//! cohort tracks the hash of the last pushed response and partitions its
//! subscribers into *existing* (have received at least one response) and
//! *new* (joined since the last snapshot, guaranteed an unconditional
//! first delivery).
//!
//! # Thread Safety
//!
//! Both subscriber maps live behind a single `RwLock`, so every mutation
//! and [`Cohort::snapshot_and_promote`] is one critical section: the two
//! maps are never observed mid-move, and the disjointness invariant holds
//! at every observable instant. [`CohortMap::remove_subscriber`] fuses
//! subscriber removal with empty-cohort removal in one write-lock scope —
//! a cohort with zero subscribers is never observable from outside.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::hash::ResponseHash;
use crate::subscriber::{Subscriber, SubscriberId, SubscriberMap};

/// Subscriber list captured by a snapshot.
pub type SubscriberList = SmallVec<[Arc<Subscriber>; 8]>;

// ---------------------------------------------------------------------------
// CohortId
// ---------------------------------------------------------------------------

/// Opaque cohort identifier (128-bit random).
///
/// Embedded into the multiplexed SQL so the database returns payloads
/// tagged by cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortId(Uuid);

impl CohortId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CohortId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CohortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CohortVariables
// ---------------------------------------------------------------------------

/// The fully-resolved variable bundle of one cohort: session variables
/// plus validated query variables.
///
/// Structural equality over both maps defines cohort membership. `BTreeMap`
/// keeps the serialized form canonical, so equal bundles serialize (and
/// hash) identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortVariables {
    session: BTreeMap<String, String>,
    query: BTreeMap<String, serde_json::Value>,
}

impl CohortVariables {
    /// Builds a variable bundle from resolved session and query variables.
    #[must_use]
    pub fn new(
        session: BTreeMap<String, String>,
        query: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self { session, query }
    }

    /// The session variables.
    #[must_use]
    pub fn session(&self) -> &BTreeMap<String, String> {
        &self.session
    }

    /// The validated query variables.
    #[must_use]
    pub fn query(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.query
    }
}

impl std::hash::Hash for CohortVariables {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for (name, value) in &self.session {
            name.hash(state);
            value.hash(state);
        }
        // serde_json::Value has no Hash; the canonical serialization does.
        for (name, value) in &self.query {
            name.hash(state);
            serde_json::to_string(value).unwrap_or_default().hash(state);
        }
    }
}

// ---------------------------------------------------------------------------
// Cohort
// ---------------------------------------------------------------------------

/// The two subscriber partitions, guarded together by one lock.
#[derive(Default)]
struct CohortSubscribers {
    existing: SubscriberMap,
    new: SubscriberMap,
}

/// A set of subscribers sharing identical variables within a poller.
pub struct Cohort {
    id: CohortId,
    /// Hash of the last successfully pushed payload; `None` before the
    /// first non-error push and after every error push.
    previous_hash: Mutex<Option<ResponseHash>>,
    subscribers: RwLock<CohortSubscribers>,
}

impl Cohort {
    /// Creates an empty cohort.
    #[must_use]
    pub fn new(id: CohortId) -> Self {
        Self {
            id,
            previous_hash: Mutex::new(None),
            subscribers: RwLock::new(CohortSubscribers::default()),
        }
    }

    /// The cohort id.
    #[must_use]
    pub fn id(&self) -> CohortId {
        self.id
    }

    /// Inserts a subscriber into the *new* partition.
    pub fn add_subscriber(&self, subscriber: Arc<Subscriber>) {
        let mut subs = self.subscribers.write();
        debug_assert!(
            !subs.existing.contains(subscriber.id()),
            "subscriber re-added while still in the existing partition"
        );
        subs.new.insert(subscriber);
    }

    /// Removes a subscriber from whichever partition contains it.
    ///
    /// Returns `(removed, remaining_total)` so the caller can delete an
    /// emptied cohort inside the same critical section it holds.
    pub fn remove_subscriber(&self, id: SubscriberId) -> (bool, usize) {
        let mut subs = self.subscribers.write();
        let removed = subs.new.remove(id).is_some() || subs.existing.remove(id).is_some();
        (removed, subs.existing.len() + subs.new.len())
    }

    /// Total subscriber count over both partitions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let subs = self.subscribers.read();
        subs.existing.len() + subs.new.len()
    }

    /// Number of subscribers in the *new* partition.
    #[must_use]
    pub fn new_count(&self) -> usize {
        self.subscribers.read().new.len()
    }

    /// The hash of the last pushed response, if any.
    #[must_use]
    pub fn previous_hash(&self) -> Option<ResponseHash> {
        *self.previous_hash.lock()
    }

    /// Writes the post-diff hash back after a push.
    pub fn store_hash(&self, hash: Option<ResponseHash>) {
        *self.previous_hash.lock() = hash;
    }

    /// Runs `f` over the subscribers of each partition (existing, new).
    ///
    /// Read-only; used by the dump utilities.
    pub fn with_subscribers<R>(&self, f: impl FnOnce(&SubscriberMap, &SubscriberMap) -> R) -> R {
        let subs = self.subscribers.read();
        f(&subs.existing, &subs.new)
    }

    /// Atomically captures a consistent per-tick view of this cohort and
    /// promotes every *new* subscriber to *existing*.
    ///
    /// After this call the *new* partition is empty and every previously
    /// new subscriber is in *existing*. Subscribers that arrive after the
    /// snapshot are new on the next tick.
    pub fn snapshot_and_promote(self: Arc<Self>, variables: &CohortVariables) -> CohortSnapshot {
        let mut subs = self.subscribers.write();

        let existing: SubscriberList = subs.existing.values().cloned().collect();
        let newly_joined: SubscriberList = subs.new.values().cloned().collect();
        let drained: Vec<_> = subs.new.drain().collect();
        for subscriber in drained {
            subs.existing.insert(subscriber);
        }

        let previous_hash = *self.previous_hash.lock();
        drop(subs);

        CohortSnapshot {
            variables: variables.clone(),
            previous_hash,
            existing,
            newly_joined,
            cohort: self,
        }
    }
}

impl std::fmt::Debug for Cohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscribers.read();
        f.debug_struct("Cohort")
            .field("id", &self.id)
            .field("existing", &subs.existing.len())
            .field("new", &subs.new.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CohortSnapshot
// ---------------------------------------------------------------------------

/// A consistent per-cohort view used for one tick: variables, the
/// subscriber lists at snapshot time, and a handle back to the cohort's
/// hash cell so the push phase can write the post-diff hash.
pub struct CohortSnapshot {
    /// The cohort's variable bundle at snapshot time.
    pub variables: CohortVariables,
    /// The hash cell value at snapshot time.
    pub previous_hash: Option<ResponseHash>,
    /// Subscribers that had already received at least one response.
    pub existing: SubscriberList,
    /// Subscribers promoted by this snapshot; they receive the next
    /// response unconditionally.
    pub newly_joined: SubscriberList,
    cohort: Arc<Cohort>,
}

impl CohortSnapshot {
    /// The snapshotted cohort's id.
    #[must_use]
    pub fn cohort_id(&self) -> CohortId {
        self.cohort.id()
    }

    /// Reads the hash cell through the handle.
    #[must_use]
    pub fn current_hash(&self) -> Option<ResponseHash> {
        self.cohort.previous_hash()
    }

    /// Writes the post-diff hash through the handle.
    pub fn store_hash(&self, hash: Option<ResponseHash>) {
        self.cohort.store_hash(hash);
    }
}

impl std::fmt::Debug for CohortSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortSnapshot")
            .field("cohort_id", &self.cohort.id())
            .field("existing", &self.existing.len())
            .field("newly_joined", &self.newly_joined.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CohortMap
// ---------------------------------------------------------------------------

/// Outcome of a fused remove-subscriber operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedSubscriber {
    /// Whether the subscriber was present and removed.
    pub removed: bool,
    /// Whether the removal emptied the cohort, deleting it from the map.
    pub cohort_removed: bool,
}

/// Mapping from resolved variables to cohorts, owned by one poller.
///
/// Supports atomic insert, fused remove, and snapshot iteration: the
/// snapshot sees a consistent set of entries at one logical instant.
#[derive(Default)]
pub struct CohortMap {
    cohorts: RwLock<FxHashMap<CohortVariables, Arc<Cohort>>>,
}

impl CohortMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a subscriber, creating the cohort for `variables` if absent.
    ///
    /// Returns the cohort id and whether the cohort was created by this
    /// call.
    pub fn add_subscriber(
        &self,
        variables: CohortVariables,
        subscriber: Arc<Subscriber>,
    ) -> (CohortId, bool) {
        let mut cohorts = self.cohorts.write();
        let mut created = false;
        let cohort = cohorts.entry(variables).or_insert_with(|| {
            created = true;
            Arc::new(Cohort::new(CohortId::new()))
        });
        cohort.add_subscriber(subscriber);
        (cohort.id(), created)
    }

    /// Removes a subscriber and, if that empties its cohort, deletes the
    /// cohort in the same atomic action.
    pub fn remove_subscriber(
        &self,
        variables: &CohortVariables,
        id: SubscriberId,
    ) -> RemovedSubscriber {
        let mut cohorts = self.cohorts.write();
        let Some(cohort) = cohorts.get(variables) else {
            return RemovedSubscriber {
                removed: false,
                cohort_removed: false,
            };
        };
        let (removed, remaining) = cohort.remove_subscriber(id);
        let cohort_removed = removed && remaining == 0;
        if cohort_removed {
            cohorts.remove(variables);
        }
        RemovedSubscriber {
            removed,
            cohort_removed,
        }
    }

    /// Lists all `(variables, cohort)` pairs at one logical instant.
    #[must_use]
    pub fn entries(&self) -> Vec<(CohortVariables, Arc<Cohort>)> {
        self.cohorts
            .read()
            .iter()
            .map(|(variables, cohort)| (variables.clone(), Arc::clone(cohort)))
            .collect()
    }

    /// Number of live cohorts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cohorts.read().len()
    }

    /// Whether the map has no cohorts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cohorts.read().is_empty()
    }

    /// Total subscriber count over all cohorts.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.cohorts
            .read()
            .values()
            .map(|c| c.subscriber_count())
            .sum()
    }
}

impl std::fmt::Debug for CohortMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortMap")
            .field("len", &self.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
