//! Read-only introspection of live-query state.
//!
//! Used by the admin surface to inspect what the process is polling.
//! Walks the poller map without disturbing it: every accessor takes only
//! brief read locks.

use serde_json::{json, Value};

use crate::poll::LiveQueryOptions;
use crate::poller::PollerMap;
use crate::subscriber::SubscriberMap;

/// Serializes the whole poller map.
///
/// The base form carries ids, worker state, cohort membership, and the
/// per-cohort response hash. `extended` adds the cohort variables, the
/// generated SQL, and the poll options.
#[must_use]
pub fn dump_poller_map(pollers: &PollerMap, options: LiveQueryOptions, extended: bool) -> Value {
    let mut total_subscribers = 0usize;

    let pollers_json: Vec<Value> = pollers
        .entries()
        .iter()
        .map(|(key, poller)| {
            let io = poller.io().get();
            let cohorts: Vec<Value> = poller
                .cohorts()
                .entries()
                .iter()
                .map(|(variables, cohort)| {
                    let (existing, new) = cohort.with_subscribers(|existing, new| {
                        (dump_subscribers(existing), dump_subscribers(new))
                    });
                    let mut entry = json!({
                        "cohort_id": cohort.id(),
                        "previous_response_hash": cohort.previous_hash(),
                        "existing_subscribers": existing,
                        "new_subscribers": new,
                    });
                    if extended {
                        entry["variables"] =
                            serde_json::to_value(variables).unwrap_or(Value::Null);
                    }
                    entry
                })
                .collect();

            total_subscribers += poller.cohorts().subscriber_count();

            let mut entry = json!({
                "source": key.source,
                "role": key.role,
                "poller_id": io.as_ref().map(|io| io.poller_id()),
                "worker_state": if io.is_some() { "running" } else { "initializing" },
                "uptime_seconds": poller.uptime().as_secs(),
                "ticks": poller.tick_count(),
                "cohorts": cohorts,
            });
            if extended {
                entry["generated_sql"] = Value::String(key.query.clone());
            }
            entry
        })
        .collect();

    let mut root = json!({
        "pollers": pollers_json,
        "total_subscribers": total_subscribers,
    });
    if extended {
        root["live_query_options"] =
            serde_json::to_value(options).unwrap_or(Value::Null);
    }
    root
}

fn dump_subscribers(map: &SubscriberMap) -> Value {
    Value::Array(
        map.values()
            .map(|s| {
                json!({
                    "subscriber_id": s.id(),
                    "metadata": s.metadata(),
                    "request_id": s.request_id(),
                    "operation_name": s.operation_name(),
                })
            })
            .collect(),
    )
}

// ===========================================================================
// Tests
// ===========================================================================
