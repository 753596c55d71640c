//! End-to-end behavior of the live view against the in-memory collaborators.
//!
//! Covers:
//! - Documented aggregation scenarios through the feed
//! - Out-of-order delivery and the history window
//! - Close racing deliveries on other threads
//! - Reconnect backoff, stale state, and exhausted retries
//! - Role gating from session resolution to presentation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use live_view::config::ViewConfig;
use live_view::context::ViewContext;
use live_view::feed::QueryDescriptor;
use live_view::memory::{MemoryAuth, MemoryFeed, MemoryProfiles};
use live_view::session::SessionResolver;
use live_view::subscription::{SubscriptionManager, SubscriptionPhase};
use serde_json::json;
use types::errors::ViewError;
use types::session::{Identity, Profile, Role};
use types::snapshot::{Products, Snapshot, Timestamp};

const COLLECTION: &str = "product_counts";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config() -> ViewConfig {
    ViewConfig {
        first_delivery_timeout_ms: 50,
        ..ViewConfig::default()
    }
}

fn snap(id: &str, ts: i64, milk: i64) -> Snapshot {
    Snapshot::new(id, ts, Products::from_pairs([("Milk", milk)]))
}

#[tokio::test]
async fn test_summary_scenarios_from_documents() {
    init_tracing();
    let feed = Arc::new(MemoryFeed::new());
    feed.publish_document("a", json!({"timestamp": 1, "products": {"Milk": 3, "Bread": 2}}))
        .unwrap();

    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();

    let view = manager.aggregate().unwrap();
    assert_eq!(view.total_units, 5);
    assert_eq!(view.distinct_categories, 2);
    assert_eq!(view.chart_series.labels, vec!["Milk", "Bread"]);
    assert_eq!(view.chart_series.values, vec![3, 2]);

    feed.publish_document("b", json!({"timestamp": 2, "products": {}})).unwrap();
    let view = manager.aggregate().unwrap();
    assert_eq!(view.total_units, 0);
    assert_eq!(view.distinct_categories, 0);
    assert!(view.chart_series.labels.is_empty());
    assert_eq!(view.chart_series.values, vec![0]);

    feed.publish_document("c", json!({"timestamp": 3, "products": {"Cornflakes": 1}}))
        .unwrap();
    assert_eq!(manager.aggregate().unwrap().chart_series.labels, vec!["Cornflak..."]);

    feed.publish_document("d", json!({"timestamp": 4})).unwrap();
    let view = manager.aggregate().unwrap();
    assert_eq!(view.total_units, 0);
    assert!(!view.malformed);
}

#[tokio::test]
async fn test_single_out_of_order_deliveries_keep_strictly_newer_heads() {
    let feed = Arc::new(MemoryFeed::new());
    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::history(COLLECTION)).await.unwrap();
    assert_eq!(manager.phase(), SubscriptionPhase::Subscribing);

    for ts in [5, 3, 7, 6] {
        feed.deliver_raw(vec![snap(&format!("s{}", ts), ts, ts)]);
    }

    let stamps: Vec<Timestamp> = manager
        .history()
        .iter()
        .map(|e| e.snapshot.timestamp().clone())
        .collect();
    assert_eq!(stamps, vec![Timestamp::Numeric(7), Timestamp::Numeric(5)]);
    assert_eq!(manager.aggregate().unwrap().total_units, 7);
    assert_eq!(manager.metrics().export()["snapshots_rejected"], 2);
}

#[tokio::test]
async fn test_history_screen_shows_store_result_set() {
    let feed = Arc::new(MemoryFeed::new());
    let auth = Arc::new(MemoryAuth::new());
    let resolver = Arc::new(SessionResolver::new(auth, Arc::new(MemoryProfiles::new())));
    let context = ViewContext::new(feed.clone(), resolver, config());
    context.open_history().await.unwrap();

    for ts in [5, 3, 7, 6] {
        feed.publish(snap(&format!("s{}", ts), ts, ts));
    }

    let current = context.current_view().await;
    let stamps: Vec<Timestamp> = current.view.history.iter().map(|e| e.timestamp.clone()).collect();
    assert_eq!(
        stamps,
        vec![
            Timestamp::Numeric(7),
            Timestamp::Numeric(6),
            Timestamp::Numeric(5),
            Timestamp::Numeric(3)
        ]
    );
    assert!(current.view.history[0].freshest);
    assert_eq!(current.view.aggregate.unwrap().total_units, 7);
}

#[tokio::test]
async fn test_history_window_is_bounded() {
    let feed = Arc::new(MemoryFeed::new());
    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::history(COLLECTION)).await.unwrap();

    for ts in 1..=15 {
        feed.publish(snap(&format!("s{}", ts), ts, 1));
    }

    let history = manager.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history[0].snapshot.id().as_str(), "s15");
    assert!(history[0].freshest);
    assert!(history[1..].iter().all(|e| !e.freshest));
    assert!(history
        .windows(2)
        .all(|w| w[0].snapshot.timestamp() > w[1].snapshot.timestamp()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_wins_against_concurrent_deliveries() {
    let feed = Arc::new(MemoryFeed::new());
    feed.publish(snap("seed", 0, 1));
    let manager = SubscriptionManager::new(feed.clone(), config());
    let handle = manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let feed = feed.clone();
            let running = running.clone();
            thread::spawn(move || {
                let mut ts = 1;
                while running.load(Ordering::SeqCst) {
                    feed.deliver_raw(vec![snap(&format!("w{}-{}", worker, ts), ts * 10 + worker, 2)]);
                    ts += 1;
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert!(handle.close());
    let after_close = manager.state();

    thread::sleep(Duration::from_millis(20));
    running.store(false, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap();
    }

    let settled = manager.state();
    assert_eq!(settled.revision, after_close.revision);
    assert_eq!(settled.history, after_close.history);
    assert_eq!(settled.phase, SubscriptionPhase::Closed);
    assert_eq!(feed.subscriber_count(), 0);
    assert_eq!(feed.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_reconnects_and_clears_stale() {
    init_tracing();
    let feed = Arc::new(MemoryFeed::new());
    feed.publish(snap("a", 1, 4));
    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();

    feed.fail_transport("connection reset");
    assert_eq!(manager.phase(), SubscriptionPhase::Reconnecting { attempt: 1 });
    assert!(manager.is_stale());
    assert_eq!(manager.aggregate().unwrap().total_units, 4);
    assert_eq!(feed.subscriber_count(), 0);

    feed.publish(snap("b", 2, 9));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.phase(), SubscriptionPhase::Reconnecting { attempt: 1 });

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(manager.phase(), SubscriptionPhase::Live);
    assert!(!manager.is_stale());
    assert_eq!(manager.aggregate().unwrap().total_units, 9);
    assert_eq!(feed.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_close_with_last_known_state() {
    let feed = Arc::new(MemoryFeed::new());
    feed.publish(snap("a", 1, 4));
    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();

    feed.fail_next_subscribes(10);
    feed.fail_transport("network down");

    // 1 + 2 + 4 + 8 + 16 seconds of backoff.
    tokio::time::sleep(Duration::from_secs(40)).await;

    let state = manager.state();
    assert_eq!(state.phase, SubscriptionPhase::Closed);
    assert!(matches!(
        state.error,
        Some(ViewError::RetriesExhausted { attempts: 5, .. })
    ));
    assert!(state.stale);
    assert_eq!(state.aggregate.as_ref().unwrap().total_units, 4);
    assert_eq!(manager.metrics().export()["reconnect_attempts"], 5);
    assert_eq!(feed.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_backoff_cancels_reconnect() {
    let feed = Arc::new(MemoryFeed::new());
    feed.publish(snap("a", 1, 4));
    let manager = SubscriptionManager::new(feed.clone(), config());
    let handle = manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();

    feed.fail_transport("connection reset");
    assert!(manager.close(&handle));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.phase(), SubscriptionPhase::Closed);
    assert_eq!(feed.subscriber_count(), 0);
}

#[tokio::test]
async fn test_role_gating_end_to_end() {
    let feed = Arc::new(MemoryFeed::new());
    feed.publish(Snapshot::new(
        "Xk2p9QmZ0aB7cD4eF",
        "2025-03-01 08:00:00",
        Products::from_pairs([("Milk", 3), ("Bread", 2)]),
    ));

    let auth = Arc::new(MemoryAuth::new());
    let profiles = Arc::new(MemoryProfiles::new());
    let boss = Identity::new("boss", Some("boss@example.com".to_string()));
    profiles.insert(
        &boss.uid,
        Profile {
            role: Some("admin".to_string()),
            display_name: Some("The Boss".to_string()),
            ..Profile::default()
        },
    );
    let resolver = Arc::new(SessionResolver::new(auth.clone(), profiles.clone()));
    let listener = resolver.spawn_auth_listener();
    let context = ViewContext::new(feed.clone(), resolver.clone(), config());
    context.open_history().await.unwrap();

    // Nobody signed in: employee projection.
    let anonymous = context.current_view().await;
    assert_eq!(anonymous.role, Role::Employee);
    let json = serde_json::to_string(&anonymous.view).unwrap();
    assert!(!json.contains("Xk2p9Qm"));

    auth.sign_in(boss);
    let admin = context.current_view().await;
    assert_eq!(admin.role, Role::Admin);
    assert_eq!(admin.display_name, "The Boss");
    assert_eq!(admin.view.history[0].short_id.as_deref(), Some("Xk2p9QmZ0aB7..."));
    assert!(admin.view.capabilities.manage_records);

    resolver.logout().await;
    let after_logout = context.current_view().await;
    assert_eq!(after_logout.role, Role::Employee);
    assert!(!after_logout.view.exposes_admin_fields());
    listener.abort();
}

#[tokio::test]
async fn test_updates_channel_reports_each_applied_change() {
    let feed = Arc::new(MemoryFeed::new());
    let manager = SubscriptionManager::new(feed.clone(), config());
    manager.open(QueryDescriptor::latest(COLLECTION)).await.unwrap();
    let mut updates = manager.updates();
    let _ = updates.borrow_and_update();

    feed.publish(snap("a", 1, 2));
    assert!(updates.has_changed().unwrap());
    let state = updates.borrow_and_update().clone();
    assert_eq!(state.phase, SubscriptionPhase::Live);
    assert_eq!(state.aggregate.as_ref().unwrap().total_units, 2);
}
