//! Feed collaborator contract
//!
//! The backend document store is consumed only through [`SnapshotFeed`]:
//! register a query with a sink, get back an [`Unsubscribe`] release
//! primitive. Deliveries carry the query's current result set, newest first,
//! exactly as the store reports it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use types::errors::FeedError;
use types::snapshot::Snapshot;

/// Number of snapshots requested by the history view.
pub const HISTORY_QUERY_LIMIT: usize = 10;

/// Sort direction on the snapshot timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Descending,
    Ascending,
}

/// Query registered with the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection: String,
    pub order_by: String,
    pub order: Order,
    pub limit: usize,
}

impl QueryDescriptor {
    /// Most recent snapshot only, for the summary view.
    pub fn latest(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: "timestamp".to_string(),
            order: Order::Descending,
            limit: 1,
        }
    }

    /// Most recent `limit` snapshots, descending by timestamp.
    pub fn recent(collection: impl Into<String>, limit: usize) -> Self {
        Self {
            collection: collection.into(),
            order_by: "timestamp".to_string(),
            order: Order::Descending,
            limit,
        }
    }

    /// History view query with the standard limit.
    pub fn history(collection: impl Into<String>) -> Self {
        Self::recent(collection, HISTORY_QUERY_LIMIT)
    }
}

/// Notification pushed by the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Current result set of the query.
    Next(Vec<Snapshot>),
    Error(FeedError),
}

/// Callback endpoint handed to the feed on subscribe.
///
/// Cheap to clone; the feed may call it from any thread.
#[derive(Clone)]
pub struct FeedSink {
    deliver: Arc<dyn Fn(FeedEvent) + Send + Sync>,
}

impl FeedSink {
    pub fn new(deliver: impl Fn(FeedEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn next(&self, snapshots: Vec<Snapshot>) {
        (self.deliver)(FeedEvent::Next(snapshots));
    }

    pub fn error(&self, err: FeedError) {
        (self.deliver)(FeedEvent::Error(err));
    }

    pub fn send(&self, event: FeedEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for FeedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSink").finish_non_exhaustive()
    }
}

/// Synchronous release primitive returned by [`SnapshotFeed::subscribe`].
///
/// Consumed on use, so it can only ever run once.
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(release))
    }

    /// Release that does nothing, for feeds without server-side state.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

/// Backend document store as seen by the live view.
pub trait SnapshotFeed: Send + Sync {
    /// Register `query`; the feed calls `sink` with every result set and
    /// error until the returned [`Unsubscribe`] is called.
    ///
    /// The feed may deliver synchronously from inside this call.
    fn subscribe(&self, query: &QueryDescriptor, sink: FeedSink) -> Unsubscribe;
}
