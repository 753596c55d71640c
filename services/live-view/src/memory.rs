//! In-process collaborators
//!
//! `MemoryFeed`, `MemoryAuth`, and `MemoryProfiles` implement the feed and
//! auth/profile contracts entirely in memory. They back the test suite and
//! let an application wire the live view before a real backend exists.
//! Fault injection (transport failures, denied access) is explicit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use types::errors::{FeedError, ProfileError, SnapshotError};
use types::ids::{SnapshotId, UserId};
use types::session::{Identity, Profile};
use types::snapshot::Snapshot;

use crate::feed::{FeedEvent, FeedSink, Order, QueryDescriptor, SnapshotFeed, Unsubscribe};
use crate::session::{AuthEvent, AuthProvider, ProfileStore};

/// Collection used by [`MemoryFeed::publish`].
pub const DEFAULT_COLLECTION: &str = "product_counts";

struct Subscriber {
    query: QueryDescriptor,
    sink: FeedSink,
}

#[derive(Default)]
struct FeedInner {
    collections: BTreeMap<String, Vec<Snapshot>>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber: u64,
    denied: Option<String>,
    /// Upcoming `subscribe` calls answered with a transport error.
    failing_subscribes: u32,
    releases: usize,
}

impl FeedInner {
    fn result_set(&self, query: &QueryDescriptor) -> Vec<Snapshot> {
        let mut docs = self
            .collections
            .get(&query.collection)
            .cloned()
            .unwrap_or_default();
        docs.sort_by(|a, b| a.timestamp().cmp(b.timestamp()));
        if query.order == Order::Descending {
            docs.reverse();
        }
        docs.truncate(query.limit);
        docs
    }
}

/// Document store double delivering query result sets synchronously.
///
/// Sinks are always invoked after the internal lock is released.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store a snapshot in the default collection and notify subscribers.
    pub fn publish(&self, snapshot: Snapshot) {
        self.publish_to(DEFAULT_COLLECTION, snapshot);
    }

    pub fn publish_to(&self, collection: &str, snapshot: Snapshot) {
        let deliveries: Vec<(FeedSink, Vec<Snapshot>)> = {
            let mut inner = self.lock();
            inner
                .collections
                .entry(collection.to_string())
                .or_default()
                .push(snapshot);
            inner
                .subscribers
                .values()
                .filter(|s| s.query.collection == collection)
                .map(|s| (s.sink.clone(), inner.result_set(&s.query)))
                .collect()
        };

        for (sink, docs) in deliveries {
            sink.next(docs);
        }
    }

    /// Store a raw backend document (`{ "timestamp": .., "products": .. }`).
    pub fn publish_document(&self, id: &str, data: Value) -> Result<(), SnapshotError> {
        let snapshot = Snapshot::from_document(SnapshotId::new(id), data)?;
        self.publish(snapshot);
        Ok(())
    }

    /// Deliver a batch to every subscriber without storing it, as a late or
    /// replayed notification would arrive.
    pub fn deliver_raw(&self, batch: Vec<Snapshot>) {
        for sink in self.sinks() {
            sink.next(batch.clone());
        }
    }

    /// Report a transport failure to every subscriber.
    pub fn fail_transport(&self, message: &str) {
        for sink in self.sinks() {
            sink.error(FeedError::Transport(message.to_string()));
        }
    }

    /// Answer the next `count` subscribe calls with a transport failure.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.lock().failing_subscribes = count;
    }

    /// Deny reads from now on and notify current subscribers.
    pub fn deny_access(&self, reason: &str) {
        self.lock().denied = Some(reason.to_string());
        for sink in self.sinks() {
            sink.error(FeedError::PermissionDenied(reason.to_string()));
        }
    }

    pub fn restore_access(&self) {
        self.lock().denied = None;
    }

    /// Registrations not yet released.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Total registrations released through their unsubscribe primitive.
    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    fn sinks(&self) -> Vec<FeedSink> {
        self.lock().subscribers.values().map(|s| s.sink.clone()).collect()
    }
}

impl SnapshotFeed for MemoryFeed {
    fn subscribe(&self, query: &QueryDescriptor, sink: FeedSink) -> Unsubscribe {
        let (key, first) = {
            let mut inner = self.lock();
            let key = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                key,
                Subscriber {
                    query: query.clone(),
                    sink: sink.clone(),
                },
            );

            let first = if let Some(reason) = inner.denied.clone() {
                FeedEvent::Error(FeedError::PermissionDenied(reason))
            } else if inner.failing_subscribes > 0 {
                inner.failing_subscribes -= 1;
                FeedEvent::Error(FeedError::Transport("injected subscribe failure".to_string()))
            } else {
                FeedEvent::Next(inner.result_set(query))
            };
            (key, first)
        };
        debug!(subscriber = key, collection = %query.collection, "Memory feed subscribed");

        // An empty collection has nothing to report yet.
        match &first {
            FeedEvent::Next(docs) if docs.is_empty() => {}
            _ => sink.send(first),
        }

        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|p| p.into_inner());
                if inner.subscribers.remove(&key).is_some() {
                    inner.releases += 1;
                }
            }
        })
    }
}

/// Auth provider double.
pub struct MemoryAuth {
    current: Mutex<Option<Identity>>,
    events: broadcast::Sender<AuthEvent>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            current: Mutex::new(None),
            events,
        }
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(identity.clone());
        let _ = self.events.send(AuthEvent::SignedIn(identity));
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    fn current_identity(&self) -> Option<Identity> {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_out(&self) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = None;
        let _ = self.events.send(AuthEvent::SignedOut);
    }
}

/// Profile store double.
#[derive(Default)]
pub struct MemoryProfiles {
    profiles: Mutex<HashMap<UserId, Profile>>,
    denied: Mutex<HashSet<UserId>>,
    lookups: AtomicUsize,
}

impl MemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uid: &UserId, profile: Profile) {
        self.profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(uid.clone(), profile);
    }

    /// Make reads of `uid` fail with permission denied.
    pub fn deny(&self, uid: &UserId) {
        self.denied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(uid.clone());
    }

    /// Number of `get_profile` calls served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfiles {
    async fn get_profile(&self, identity: &Identity) -> Result<Option<Profile>, ProfileError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self
            .denied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&identity.uid)
        {
            return Err(ProfileError::PermissionDenied {
                uid: identity.uid.to_string(),
            });
        }
        Ok(self
            .profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&identity.uid)
            .cloned())
    }
}
