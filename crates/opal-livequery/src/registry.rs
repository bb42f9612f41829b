//! The live-query registry — the transport-facing facade.
//!
//! Owns the process-wide [`PollerMap`], the poll options, the database
//! executor, and the post-poll hook. The transport layer registers and
//! removes subscriptions here; everything between (worker spawn, cohort
//! bookkeeping, poller shutdown) is handled internally.

use std::sync::Arc;

use tokio::sync::watch;

use crate::cohort::{CohortId, CohortVariables};
use crate::error::Result;
use crate::metrics::{LogPollHook, PostPollHook};
use crate::poll::{
    spawn_poller_worker, LiveQueryOptions, MultiplexedQuery, ParameterizedQueryHash, PollContext,
    SourceExecutor,
};
use crate::poller::{PollerId, PollerIo, PollerKey, PollerMap};
use crate::subscriber::{Subscriber, SubscriberId};

// ---------------------------------------------------------------------------
// LiveQueryId
// ---------------------------------------------------------------------------

/// Identifier triple of one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveQueryId {
    /// The poller the subscription multiplexes through.
    pub poller_id: PollerId,
    /// The cohort the subscription was deduplicated into.
    pub cohort_id: CohortId,
    /// The subscriber itself.
    pub subscriber_id: SubscriberId,
}

// ---------------------------------------------------------------------------
// LiveQueryRegistry
// ---------------------------------------------------------------------------

/// Process-wide live-query state.
pub struct LiveQueryRegistry {
    pollers: PollerMap,
    options: LiveQueryOptions,
    executor: Arc<dyn SourceExecutor>,
    hook: Arc<dyn PostPollHook>,
}

impl LiveQueryRegistry {
    /// Creates a registry that reports ticks through the default
    /// tracing-backed hook.
    #[must_use]
    pub fn new(options: LiveQueryOptions, executor: Arc<dyn SourceExecutor>) -> Self {
        Self::with_hook(options, executor, Arc::new(LogPollHook))
    }

    /// Creates a registry with a custom post-poll hook.
    #[must_use]
    pub fn with_hook(
        options: LiveQueryOptions,
        executor: Arc<dyn SourceExecutor>,
        hook: Arc<dyn PostPollHook>,
    ) -> Self {
        Self {
            pollers: PollerMap::new(),
            options: options.normalized(),
            executor,
            hook,
        }
    }

    /// The options every poller is spawned with.
    #[must_use]
    pub fn options(&self) -> LiveQueryOptions {
        self.options
    }

    /// Registers a subscription.
    ///
    /// Idempotently constructs the poller and cohort as needed and inserts
    /// the subscriber into the cohort's *new* partition, guaranteeing it a
    /// delivery on the poller's next tick. If this call created the
    /// poller, it spawns the worker and publishes the io state; otherwise
    /// it waits for the creating call to publish.
    pub async fn subscribe(
        &self,
        key: PollerKey,
        query_hash: ParameterizedQueryHash,
        variables: CohortVariables,
        subscriber: Subscriber,
    ) -> Result<LiveQueryId> {
        let subscriber_id = subscriber.id();
        let added = self
            .pollers
            .add_subscriber(&key, variables, Arc::new(subscriber));

        if added.poller_created {
            let poller_id = PollerId::new();
            let (stop_tx, stop_rx) = watch::channel(false);
            let ctx = PollContext {
                poller_id,
                options: self.options,
                source: key.source.clone(),
                role: key.role.clone(),
                query: MultiplexedQuery::new(key.query.clone()),
                query_hash,
                poller: Arc::clone(&added.poller),
                executor: Arc::clone(&self.executor),
                hook: Arc::clone(&self.hook),
            };
            let task = spawn_poller_worker(ctx, stop_rx);
            added
                .poller
                .io()
                .set(Arc::new(PollerIo::new(poller_id, stop_tx, task)))?;
            tracing::info!(
                poller_id = %poller_id,
                source = %key.source,
                role = %key.role,
                "Created poller"
            );
        }

        // Losers of the creation race observe the cell empty until the
        // winner publishes; wait rather than hand out a torn view.
        let io = added.poller.io().wait().await;
        Ok(LiveQueryId {
            poller_id: io.poller_id(),
            cohort_id: added.cohort_id,
            subscriber_id,
        })
    }

    /// Removes a subscription.
    ///
    /// Deletes the cohort if this was its last subscriber, and stops the
    /// poller's worker if the poller has no cohorts left. Returns whether
    /// the subscriber was present.
    pub async fn unsubscribe(
        &self,
        key: &PollerKey,
        variables: &CohortVariables,
        subscriber_id: SubscriberId,
    ) -> bool {
        let removed = self
            .pollers
            .remove_subscriber(key, variables, subscriber_id);

        if let Some(poller) = removed.stopped_poller {
            // A racing subscribe may still be publishing the io state;
            // wait for it so the stop signal cannot be lost.
            let io = poller.io().wait().await;
            io.signal_stop();
            tracing::info!(
                poller_id = %io.poller_id(),
                source = %key.source,
                role = %key.role,
                "Stopped empty poller"
            );
        }
        removed.removed
    }

    /// Read-only introspection of the whole poller map.
    #[must_use]
    pub fn dump(&self, extended: bool) -> serde_json::Value {
        crate::dump::dump_poller_map(&self.pollers, self.options, extended)
    }

    /// Number of live pollers.
    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.pollers.len()
    }

    /// Number of live cohorts across all pollers.
    #[must_use]
    pub fn cohort_count(&self) -> usize {
        self.pollers
            .entries()
            .iter()
            .map(|(_, poller)| poller.cohorts().len())
            .sum()
    }

    /// Number of subscribers across all pollers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.pollers
            .entries()
            .iter()
            .map(|(_, poller)| poller.cohorts().subscriber_count())
            .sum()
    }

    /// Stops every poller worker and waits for the tasks to finish.
    ///
    /// Intended for orderly process shutdown; in-flight ticks complete.
    pub async fn shutdown(&self) {
        let entries = self.pollers.entries();
        let mut tasks = Vec::new();
        for (_, poller) in entries {
            if let Some(io) = poller.io().get() {
                io.signal_stop();
                if let Some(task) = io.take_task() {
                    tasks.push(task);
                }
            }
        }
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "Poller worker task failed during shutdown");
            }
        }
        tracing::info!("Live query registry shut down");
    }
}

impl std::fmt::Debug for LiveQueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQueryRegistry")
            .field("pollers", &self.pollers)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::error::SourceError;
    use crate::poller::{RoleName, SourceName};
    use crate::subscriber::{on_change_fn, RequestId, SubscriberMetadata};

    struct EchoExecutor;

    #[async_trait]
    impl SourceExecutor for EchoExecutor {
        async fn run_multiplexed_query(
            &self,
            _query: &MultiplexedQuery,
            cohorts: &[(CohortId, CohortVariables)],
        ) -> std::result::Result<Vec<(CohortId, Bytes)>, SourceError> {
            Ok(cohorts
                .iter()
                .map(|(id, _)| (*id, Bytes::from_static(b"{}")))
                .collect())
        }
    }

    fn make_registry() -> LiveQueryRegistry {
        let options = LiveQueryOptions {
            batch_size: 100,
            refetch_interval: Duration::from_millis(5),
        };
        LiveQueryRegistry::new(options, Arc::new(EchoExecutor))
    }

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

    fn make_subscriber() -> Subscriber {
        Subscriber::new(
            SubscriberMetadata::new(serde_json::Value::Null),
            RequestId("req".into()),
            None,
            on_change_fn(|_| {}),
        )
    }

    // --- Subscribe tests ---

    #[tokio::test]
    async fn test_subscribe_shares_poller_and_cohort() {
        let registry = make_registry();

        let id1 = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();
        let id2 = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();
        let id3 = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("bob"),
                make_subscriber(),
            )
            .await
            .unwrap();

        // Same key => same poller; same variables => same cohort.
        assert_eq!(id1.poller_id, id2.poller_id);
        assert_eq!(id1.cohort_id, id2.cohort_id);
        assert_eq!(id2.poller_id, id3.poller_id);
        assert_ne!(id2.cohort_id, id3.cohort_id);
        assert_ne!(id1.subscriber_id, id2.subscriber_id);

        assert_eq!(registry.poller_count(), 1);
        assert_eq!(registry.cohort_count(), 2);
        assert_eq!(registry.subscriber_count(), 3);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_distinct_keys_distinct_pollers() {
        let registry = make_registry();

        let id1 = registry
            .subscribe(
                key("q1"),
                ParameterizedQueryHash("h1".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();
        let id2 = registry
            .subscribe(
                key("q2"),
                ParameterizedQueryHash("h2".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();

        assert_ne!(id1.poller_id, id2.poller_id);
        assert_eq!(registry.poller_count(), 2);

        registry.shutdown().await;
    }

    // --- Unsubscribe tests ---

    #[tokio::test]
    async fn test_unsubscribe_last_subscriber_stops_worker() {
        let registry = make_registry();
        let id = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();

        let poller = registry.pollers.get(&key("q")).unwrap();
        let io = poller.io().wait().await;

        assert!(
            registry
                .unsubscribe(&key("q"), &vars("alice"), id.subscriber_id)
                .await
        );
        assert_eq!(registry.poller_count(), 0);

        // The worker observes the stop signal and terminates.
        io.take_task().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_populated_poller() {
        let registry = make_registry();
        let id1 = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("alice"),
                make_subscriber(),
            )
            .await
            .unwrap();
        let _id2 = registry
            .subscribe(
                key("q"),
                ParameterizedQueryHash("h".into()),
                vars("bob"),
                make_subscriber(),
            )
            .await
            .unwrap();

        assert!(
            registry
                .unsubscribe(&key("q"), &vars("alice"), id1.subscriber_id)
                .await
        );
        assert_eq!(registry.poller_count(), 1);
        assert_eq!(registry.subscriber_count(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_subscriber() {
        let registry = make_registry();
        assert!(
            !registry
                .unsubscribe(&key("q"), &vars("alice"), SubscriberId::new())
                .await
        );
    }

    // --- Race tests ---

    #[tokio::test]
    async fn test_concurrent_subscribes_one_worker() {
        let registry = Arc::new(make_registry());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .subscribe(
                        key("contended"),
                        ParameterizedQueryHash("h".into()),
                        vars("alice"),
                        make_subscriber(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let ids: Vec<LiveQueryId> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // All racers landed in the same poller and cohort.
        let first = ids[0];
        assert!(ids.iter().all(|id| id.poller_id == first.poller_id));
        assert!(ids.iter().all(|id| id.cohort_id == first.cohort_id));
        assert_eq!(registry.poller_count(), 1);
        assert_eq!(registry.subscriber_count(), 16);

        registry.shutdown().await;
    }
}
