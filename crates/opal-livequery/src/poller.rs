//! Pollers and the process-wide poller map.
//!
//! A [`Poller`] owns one multiplexed query: every subscription whose
//! `(source, role, query text)` triple matches shares it, and exactly one
//! worker task polls the database on its behalf. The [`PollerMap`] is the
//! process-wide mapping from [`PollerKey`] to poller, alive for the life
//! of the process.
//!
//! # Worker publication
//!
//! Creating a poller and spawning its worker cannot be one atomic step:
//! the map insertion is atomic, the setup (spawn the task, allocate the
//! id) is not. The [`IoStateCell`] closes the gap — it is a write-once
//! publication slot. A reader either observes the cell empty (setup in
//! progress) and waits, or observes the fully-initialized [`PollerIo`];
//! never a torn value. Only the task that won the insertion race may fill
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cohort::{CohortId, CohortMap, CohortVariables, RemovedSubscriber};
use crate::error::{Error, Result};
use crate::subscriber::{Subscriber, SubscriberId};

// ---------------------------------------------------------------------------
// SourceName / RoleName / PollerKey
// ---------------------------------------------------------------------------

/// Name of the database source a poller executes against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceName(pub String);

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role the query was planned for; permissions are resolved upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleName(pub String);

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a poller: two subscriptions share a poller iff their keys
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollerKey {
    /// The database source.
    pub source: SourceName,
    /// The role the query was planned for.
    pub role: RoleName,
    /// The multiplexed query text.
    pub query: String,
}

// ---------------------------------------------------------------------------
// PollerId / PollerIo / IoStateCell
// ---------------------------------------------------------------------------

/// Opaque poller identifier (128-bit random), allocated when the worker
/// is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollerId(Uuid);

impl PollerId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PollerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PollerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The worker-side state of a poller: its id, the stop signal, and the
/// task handle.
pub struct PollerIo {
    poller_id: PollerId,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollerIo {
    /// Bundles a freshly spawned worker.
    #[must_use]
    pub fn new(poller_id: PollerId, stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            poller_id,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// The poller id allocated at spawn time.
    #[must_use]
    pub fn poller_id(&self) -> PollerId {
        self.poller_id
    }

    /// Signals the worker to terminate. The worker observes the signal
    /// between ticks and during the inter-tick sleep.
    pub fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Takes the worker task handle, if not already taken.
    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

impl std::fmt::Debug for PollerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerIo")
            .field("poller_id", &self.poller_id)
            .finish_non_exhaustive()
    }
}

/// Write-once publication cell for a poller's [`PollerIo`].
pub struct IoStateCell {
    cell: watch::Sender<Option<Arc<PollerIo>>>,
}

impl IoStateCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { cell: tx }
    }

    /// Publishes the worker state. Fails if the cell was already filled.
    pub fn set(&self, io: Arc<PollerIo>) -> Result<()> {
        let mut placed = false;
        self.cell.send_modify(|slot| {
            if slot.is_none() {
                *slot = Some(io);
                placed = true;
            }
        });
        if placed {
            Ok(())
        } else {
            Err(Error::WorkerAlreadyInitialized)
        }
    }

    /// Reads the cell without waiting.
    #[must_use]
    pub fn get(&self) -> Option<Arc<PollerIo>> {
        self.cell.borrow().clone()
    }

    /// Waits until the cell has been filled.
    pub async fn wait(&self) -> Arc<PollerIo> {
        let mut rx = self.cell.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .expect("io cell sender lives as long as the cell");
        slot.as_ref().cloned().expect("guarded by wait_for")
    }
}

impl Default for IoStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoStateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStateCell")
            .field("initialized", &self.get().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// The unit that owns one multiplexed query and its worker task.
pub struct Poller {
    cohorts: CohortMap,
    io: IoStateCell,
    created_at: Instant,
    ticks: AtomicU64,
}

impl Poller {
    /// Creates a poller with an empty cohort map and an empty io cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cohorts: CohortMap::new(),
            io: IoStateCell::new(),
            created_at: Instant::now(),
            ticks: AtomicU64::new(0),
        }
    }

    /// The poller's cohorts.
    #[must_use]
    pub fn cohorts(&self) -> &CohortMap {
        &self.cohorts
    }

    /// The worker publication cell.
    #[must_use]
    pub fn io(&self) -> &IoStateCell {
        &self.io
    }

    /// Time since the poller was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Records one completed poll tick.
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of completed poll ticks.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("cohorts", &self.cohorts.len())
            .field("io", &self.io)
            .field("ticks", &self.tick_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PollerMap
// ---------------------------------------------------------------------------

/// Outcome of [`PollerMap::add_subscriber`].
pub struct AddedSubscriber {
    /// The poller the subscriber landed in.
    pub poller: Arc<Poller>,
    /// Id of the cohort the subscriber landed in.
    pub cohort_id: CohortId,
    /// Whether this call created the poller (the caller must spawn its
    /// worker and fill the io cell).
    pub poller_created: bool,
}

/// Outcome of [`PollerMap::remove_subscriber`].
#[derive(Default)]
pub struct RemovedSubscription {
    /// Whether the subscriber was present and removed.
    pub removed: bool,
    /// Whether the removal emptied and deleted the cohort.
    pub cohort_removed: bool,
    /// The poller, if the removal emptied it and evicted it from the map.
    /// The caller must signal its worker to stop.
    pub stopped_poller: Option<Arc<Poller>>,
}

/// Process-wide mapping from [`PollerKey`] to [`Poller`].
///
/// Mutations (`add_subscriber`, `remove_subscriber`, `stop_if_empty`) run
/// under the write lock, so "the cohort map is empty" can never be
/// observed concurrently with an insert that would repopulate it — at most
/// one poller exists per key at any moment. Workers never touch this lock;
/// they only read their own poller's cohort map.
#[derive(Default)]
pub struct PollerMap {
    pollers: RwLock<FxHashMap<PollerKey, Arc<Poller>>>,
}

impl PollerMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a poller.
    #[must_use]
    pub fn get(&self, key: &PollerKey) -> Option<Arc<Poller>> {
        self.pollers.read().get(key).cloned()
    }

    /// Atomically looks up `key`, creating an empty poller if absent.
    ///
    /// Returns `(poller, is_new)`. When `is_new` is true the caller must
    /// spawn the worker and fill the io cell exactly once; every other
    /// caller waits on the cell.
    pub fn get_or_create(&self, key: &PollerKey) -> (Arc<Poller>, bool) {
        let mut pollers = self.pollers.write();
        let mut created = false;
        let poller = pollers.entry(key.clone()).or_insert_with(|| {
            created = true;
            Arc::new(Poller::new())
        });
        (Arc::clone(poller), created)
    }

    /// Atomically inserts a subscriber, creating the poller and cohort as
    /// needed.
    pub fn add_subscriber(
        &self,
        key: &PollerKey,
        variables: CohortVariables,
        subscriber: Arc<Subscriber>,
    ) -> AddedSubscriber {
        let mut pollers = self.pollers.write();
        let mut poller_created = false;
        let poller = pollers.entry(key.clone()).or_insert_with(|| {
            poller_created = true;
            Arc::new(Poller::new())
        });
        let (cohort_id, _) = poller.cohorts().add_subscriber(variables, subscriber);
        AddedSubscriber {
            poller: Arc::clone(poller),
            cohort_id,
            poller_created,
        }
    }

    /// Atomically removes a subscriber, deleting its cohort if emptied and
    /// evicting the poller if its cohort map becomes empty.
    pub fn remove_subscriber(
        &self,
        key: &PollerKey,
        variables: &CohortVariables,
        id: SubscriberId,
    ) -> RemovedSubscription {
        let mut pollers = self.pollers.write();
        let Some(poller) = pollers.get(key).cloned() else {
            return RemovedSubscription::default();
        };
        let RemovedSubscriber {
            removed,
            cohort_removed,
        } = poller.cohorts().remove_subscriber(variables, id);

        let stopped_poller = if cohort_removed && poller.cohorts().is_empty() {
            pollers.remove(key);
            Some(poller)
        } else {
            None
        };
        RemovedSubscription {
            removed,
            cohort_removed,
            stopped_poller,
        }
    }

    /// Evicts the poller for `key` if its cohort map is empty, returning
    /// it so the caller can stop its worker. Race-safe with concurrent
    /// inserts: both run under the write lock.
    pub fn stop_if_empty(&self, key: &PollerKey) -> Option<Arc<Poller>> {
        let mut pollers = self.pollers.write();
        let poller = pollers.get(key)?;
        if poller.cohorts().is_empty() {
            pollers.remove(key)
        } else {
            None
        }
    }

    /// Lists all `(key, poller)` pairs at one logical instant.
    #[must_use]
    pub fn entries(&self) -> Vec<(PollerKey, Arc<Poller>)> {
        self.pollers
            .read()
            .iter()
            .map(|(key, poller)| (key.clone(), Arc::clone(poller)))
            .collect()
    }

    /// Number of live pollers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pollers.read().len()
    }

    /// Whether the map has no pollers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pollers.read().is_empty()
    }
}

impl std::fmt::Debug for PollerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerMap")
            .field("len", &self.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::subscriber::{on_change_fn, RequestId, SubscriberMetadata};

    fn key(query: &str) -> PollerKey {
        PollerKey {
            source: SourceName("default".into()),
            role: RoleName("user".into()),
            query: query.into(),
        }
    }

    fn vars(user: &str) -> CohortVariables {
        let mut session = BTreeMap::new();
        session.insert("x-user-id".to_string(), user.to_string());
        CohortVariables::new(session, BTreeMap::new())
    }

    fn make_subscriber() -> Arc<Subscriber> {
        Arc::new(Subscriber::new(
            SubscriberMetadata::new(serde_json::Value::Null),
            RequestId("req".into()),
            None,
            on_change_fn(|_| {}),
        ))
    }

    fn spawn_noop_io() -> Arc<PollerIo> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        let task = tokio::spawn(async {});
        Arc::new(PollerIo::new(PollerId::new(), stop_tx, task))
    }

    // --- IoStateCell tests ---

    #[tokio::test]
    async fn test_io_cell_write_once() {
        let cell = IoStateCell::new();
        assert!(cell.get().is_none());

        let io = spawn_noop_io();
        let id = io.poller_id();
        cell.set(io).unwrap();
        assert_eq!(cell.get().unwrap().poller_id(), id);

        // Second set is rejected and the published value is unchanged.
        let err = cell.set(spawn_noop_io()).unwrap_err();
        assert!(matches!(err, Error::WorkerAlreadyInitialized));
        assert_eq!(cell.get().unwrap().poller_id(), id);
    }

    #[tokio::test]
    async fn test_io_cell_wait_observes_late_fill() {
        let cell = Arc::new(IoStateCell::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait().await.poller_id() })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let io = spawn_noop_io();
        let id = io.poller_id();
        cell.set(io).unwrap();

        assert_eq!(waiter.await.unwrap(), id);
    }

    // --- PollerMap tests ---

    #[test]
    fn test_poller_map_get_or_create() {
        let map = PollerMap::new();
        let (p1, new1) = map.get_or_create(&key("q1"));
        let (p2, new2) = map.get_or_create(&key("q1"));
        let (_p3, new3) = map.get_or_create(&key("q2"));

        assert!(new1);
        assert!(!new2);
        assert!(new3);
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_poller_map_add_remove_lifecycle() {
        let map = PollerMap::new();
        let sub = make_subscriber();
        let id = sub.id();

        let added = map.add_subscriber(&key("q"), vars("alice"), sub);
        assert!(added.poller_created);
        assert_eq!(map.len(), 1);
        assert_eq!(added.poller.cohorts().len(), 1);

        let removed = map.remove_subscriber(&key("q"), &vars("alice"), id);
        assert!(removed.removed);
        assert!(removed.cohort_removed);
        assert!(removed.stopped_poller.is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn test_poller_map_remove_keeps_live_poller() {
        let map = PollerMap::new();
        let a = make_subscriber();
        let b = make_subscriber();
        let a_id = a.id();
        map.add_subscriber(&key("q"), vars("alice"), a);
        map.add_subscriber(&key("q"), vars("bob"), b);

        let removed = map.remove_subscriber(&key("q"), &vars("alice"), a_id);
        assert!(removed.removed);
        assert!(removed.cohort_removed);
        assert!(removed.stopped_poller.is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_poller_map_stop_if_empty_respects_cohorts() {
        let map = PollerMap::new();
        map.add_subscriber(&key("q"), vars("alice"), make_subscriber());

        assert!(map.stop_if_empty(&key("q")).is_none());
        assert_eq!(map.len(), 1);

        let (poller, _) = map.get_or_create(&key("empty"));
        assert!(poller.cohorts().is_empty());
        assert!(map.stop_if_empty(&key("empty")).is_some());
        assert_eq!(map.len(), 1);
    }

    // --- Race tests ---

    #[test]
    fn test_poller_map_create_race_yields_one_poller() {
        let map = Arc::new(PollerMap::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let (poller, is_new) = map.get_or_create(&key("contended"));
                (Arc::as_ptr(&poller) as usize, is_new)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one winner of the insertion race; everyone saw the same
        // poller.
        assert_eq!(results.iter().filter(|(_, is_new)| *is_new).count(), 1);
        let first = results[0].0;
        assert!(results.iter().all(|(ptr, _)| *ptr == first));
        assert_eq!(map.len(), 1);
    }
}
