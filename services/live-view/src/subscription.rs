//! Live feed subscription management
//!
//! One [`SubscriptionManager`] owns the state set of one view context: the
//! history window, the aggregate of the most recently accepted snapshot, the
//! stale flag, and at most one open feed registration.
//!
//! Lifecycle:
//!
//! ```text
//!  Idle ──open──▶ Subscribing ──first delivery──▶ Live
//!                      │                          │
//!                      └──── transport error ─────┤
//!                                                 ▼
//!          Closed ◀── permission denied ── Reconnecting (backoff)
//!            ▲        or retries exhausted        │
//!            └──────────── close() ◀──────────────┘
//! ```
//!
//! Every delivery is checked against the active handle under the same lock
//! that `close()` takes, so once `close()` returns no delivery for that
//! handle can change the state, even one already in flight on another
//! thread. The feed's release primitive always runs outside the lock.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use types::errors::{FeedError, ViewError};
use types::ids::HandleId;
use types::snapshot::Snapshot;

use crate::aggregator::{aggregate, AggregateView};
use crate::config::ViewConfig;
use crate::feed::{FeedEvent, FeedSink, QueryDescriptor, SnapshotFeed, Unsubscribe};
use crate::history::{HistoryEntry, HistoryWindow, PushOutcome};
use crate::metrics::FeedMetrics;

/// Subscription lifecycle phase of a view context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SubscriptionPhase {
    Idle,
    Subscribing,
    Live,
    Reconnecting { attempt: u32 },
    Closed,
}

/// Consistent, read-only picture of a view context.
///
/// Published as one value per applied change, so readers never observe a
/// history that disagrees with the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub phase: SubscriptionPhase,
    /// Most recently opened handle.
    pub handle: Option<HandleId>,
    /// Aggregate of the most recently accepted snapshot.
    pub aggregate: Option<AggregateView>,
    /// Newest first, head flagged freshest.
    pub history: Vec<HistoryEntry>,
    /// Displayed data predates an ongoing transport outage.
    pub stale: bool,
    /// Fatal error that closed the subscription.
    pub error: Option<ViewError>,
    /// Bumped on every published change.
    pub revision: u64,
}

impl LiveState {
    fn idle() -> Self {
        Self {
            phase: SubscriptionPhase::Idle,
            handle: None,
            aggregate: None,
            history: Vec::new(),
            stale: false,
            error: None,
            revision: 0,
        }
    }
}

/// Token for one feed registration, returned by [`SubscriptionManager::open`].
///
/// Closing is idempotent and may happen from any thread, either through the
/// token or through the manager.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: HandleId,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Release the registration. Returns false if it was already released.
    pub fn close(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => close_handle(&shared, self.id, "closed by caller"),
            None => false,
        }
    }

    /// Whether this handle is still the context's open registration.
    pub fn is_open(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| lock_state(&shared).is_active(self.id))
            .unwrap_or(false)
    }
}

/// The open registration of a context.
struct ActiveSubscription {
    id: HandleId,
    query: QueryDescriptor,
    /// Bumped per (re)registration; deliveries from older ones are ignored.
    generation: u64,
    unsubscribe: Option<Unsubscribe>,
    retry: Option<AbortHandle>,
    attempts: u32,
    last_error: Option<FeedError>,
    runtime: Option<RuntimeHandle>,
}

impl ActiveSubscription {
    fn release(mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.call();
        }
    }
}

struct ContextState {
    phase: SubscriptionPhase,
    last_handle: Option<HandleId>,
    history: HistoryWindow,
    aggregate: Option<AggregateView>,
    stale: bool,
    error: Option<ViewError>,
    active: Option<ActiveSubscription>,
    revision: u64,
}

impl ContextState {
    fn new(capacity: usize) -> Self {
        Self {
            phase: SubscriptionPhase::Idle,
            last_handle: None,
            history: HistoryWindow::new(capacity),
            aggregate: None,
            stale: false,
            error: None,
            active: None,
            revision: 0,
        }
    }

    fn is_active(&self, id: HandleId) -> bool {
        self.active.as_ref().map(|a| a.id == id).unwrap_or(false)
    }

    fn active_generation(&mut self, id: HandleId, generation: u64) -> Option<&mut ActiveSubscription> {
        self.active
            .as_mut()
            .filter(|a| a.id == id && a.generation == generation)
    }

    fn to_live_state(&self) -> LiveState {
        LiveState {
            phase: self.phase,
            handle: self.last_handle,
            aggregate: self.aggregate.clone(),
            history: self.history.entries(),
            stale: self.stale,
            error: self.error.clone(),
            revision: self.revision,
        }
    }
}

struct Shared {
    feed: Arc<dyn SnapshotFeed>,
    config: ViewConfig,
    metrics: FeedMetrics,
    state: Mutex<ContextState>,
    updates: watch::Sender<Arc<LiveState>>,
}

impl Shared {
    /// Publish the current state. Must be called with the state lock held so
    /// that published revisions follow mutation order.
    fn publish(&self, state: &mut ContextState) {
        state.revision += 1;
        self.updates.send_replace(Arc::new(state.to_live_state()));
    }
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, ContextState> {
    shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the live subscription and state set of one view context.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn SnapshotFeed>, config: ViewConfig) -> Self {
        let state = ContextState::new(config.history_capacity);
        let (updates, _) = watch::channel(Arc::new(LiveState::idle()));
        Self {
            shared: Arc::new(Shared {
                feed,
                config,
                metrics: FeedMetrics::new(),
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    /// Open a subscription for `query`, closing any previous one first.
    ///
    /// Resolves once the first delivery or error arrives, or when the
    /// configured first-delivery timeout elapses (the handle is then returned
    /// still subscribing). A permission-denied first response is returned as
    /// an error; the handle is closed in that case.
    pub async fn open(&self, query: QueryDescriptor) -> Result<SubscriptionHandle, ViewError> {
        let id = HandleId::new();
        let mut updates = self.shared.updates.subscribe();
        // Install the new handle and take the previous one in one step, so
        // concurrent opens each release exactly the handle they replaced.
        let previous = {
            let mut state = lock_state(&self.shared);
            let previous = state.active.take();
            state.history = HistoryWindow::new(self.shared.config.history_capacity);
            state.aggregate = None;
            state.stale = false;
            state.error = None;
            state.phase = SubscriptionPhase::Subscribing;
            state.last_handle = Some(id);
            state.active = Some(ActiveSubscription {
                id,
                query: query.clone(),
                generation: 0,
                unsubscribe: None,
                retry: None,
                attempts: 0,
                last_error: None,
                runtime: RuntimeHandle::try_current().ok(),
            });
            self.shared.publish(&mut state);
            previous
        };

        if let Some(previous) = previous {
            let replaced = previous.id;
            previous.release();
            info!(handle = %replaced, reason = "replaced by a new subscription", "Subscription closed");
        }

        info!(
            handle = %id,
            collection = %query.collection,
            limit = query.limit,
            "Opening subscription"
        );
        register(&self.shared, id, 0, &query);

        let first_delivery = async {
            loop {
                let settled = {
                    let current = updates.borrow_and_update();
                    current.handle != Some(id) || current.phase != SubscriptionPhase::Subscribing
                };
                if settled || updates.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.shared.config.first_delivery_timeout(), first_delivery)
            .await
            .is_err()
        {
            warn!(handle = %id, "No delivery before first-delivery timeout, still subscribing");
        }

        let current = self.state();
        if current.handle == Some(id) && current.phase == SubscriptionPhase::Closed {
            if let Some(err) = current.error.clone() {
                return Err(err);
            }
        }

        Ok(SubscriptionHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Release `handle`. Idempotent; returns false if it was already released
    /// or replaced. No delivery for the handle is honored after this returns.
    pub fn close(&self, handle: &SubscriptionHandle) -> bool {
        close_handle(&self.shared, handle.id, "closed by caller")
    }

    /// Release whichever handle is currently open.
    pub fn close_current(&self) -> bool {
        close_active(&self.shared, "closed by caller")
    }

    /// Latest published state, answered from memory.
    pub fn state(&self) -> Arc<LiveState> {
        self.shared.updates.borrow().clone()
    }

    /// Change notifications carrying each newly published state.
    pub fn updates(&self) -> watch::Receiver<Arc<LiveState>> {
        self.shared.updates.subscribe()
    }

    pub fn aggregate(&self) -> Option<AggregateView> {
        self.state().aggregate.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state().history.clone()
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.state().phase
    }

    pub fn is_stale(&self) -> bool {
        self.state().stale
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &ViewConfig {
        &self.shared.config
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        close_active(&self.shared, "view context dropped");
    }
}

fn close_active(shared: &Arc<Shared>, reason: &str) -> bool {
    let active_id = lock_state(shared).active.as_ref().map(|a| a.id);
    match active_id {
        Some(id) => close_handle(shared, id, reason),
        None => false,
    }
}

fn close_handle(shared: &Arc<Shared>, id: HandleId, reason: &str) -> bool {
    let released = {
        let mut state = lock_state(shared);
        if !state.is_active(id) {
            None
        } else {
            let active = state.active.take();
            state.phase = SubscriptionPhase::Closed;
            shared.publish(&mut state);
            active
        }
    };

    match released {
        Some(active) => {
            active.release();
            info!(handle = %id, reason, "Subscription closed");
            true
        }
        None => {
            debug!(handle = %id, "Close on a handle that is no longer open");
            false
        }
    }
}

/// Register (or re-register) the active subscription with the feed.
fn register(shared: &Arc<Shared>, id: HandleId, generation: u64, query: &QueryDescriptor) {
    let weak = Arc::downgrade(shared);
    let sink = FeedSink::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            on_feed_event(&shared, id, generation, event);
        }
    });

    let unsubscribe = shared.feed.subscribe(query, sink);

    let leftover = {
        let mut state = lock_state(shared);
        match state.active_generation(id, generation) {
            Some(active) if active.unsubscribe.is_none() => {
                active.unsubscribe = Some(unsubscribe);
                None
            }
            _ => Some(unsubscribe),
        }
    };

    // Closed or superseded while the feed was registering.
    if let Some(unsubscribe) = leftover {
        debug!(handle = %id, generation, "Releasing registration that is no longer wanted");
        unsubscribe.call();
    }
}

fn on_feed_event(shared: &Arc<Shared>, id: HandleId, generation: u64, event: FeedEvent) {
    match event {
        FeedEvent::Next(batch) => apply_batch(shared, id, generation, batch),
        FeedEvent::Error(err) => apply_error(shared, id, generation, err),
    }
}

/// Apply one delivery as a single step. A multi-row result set of a history
/// query replaces the window; anything else goes oldest first through the
/// strict-newer check, the aggregate following each accepted head.
fn apply_batch(shared: &Arc<Shared>, id: HandleId, generation: u64, mut batch: Vec<Snapshot>) {
    let started = Instant::now();
    let count = batch.len() as u64;
    let mut state = lock_state(shared);

    if state.active_generation(id, generation).is_none() {
        shared.metrics.record_discarded(count);
        debug!(handle = %id, count, "Discarding delivery for a closed subscription");
        return;
    }

    shared.metrics.record_received(count);
    let adopt = batch.len() > 1
        && state
            .active
            .as_ref()
            .map(|active| active.query.limit > 1)
            .unwrap_or(false);

    if adopt {
        // A multi-row result set is the store's current top-N and replaces
        // the window as a whole.
        let kept = state.history.adopt(batch);
        shared.metrics.record_adopted(kept as u64);
        let view = state
            .history
            .head()
            .map(|head| aggregate(head, &shared.config.chart));
        if let Some(view) = &view {
            if view.malformed {
                warn!(handle = %id, snapshot = %view.source_id, "Malformed products, aggregating as empty");
            }
        }
        debug!(handle = %id, kept, "Adopted result set");
        state.aggregate = view;
    } else {
        batch.sort_by(|a, b| a.timestamp().cmp(b.timestamp()));
        for snapshot in batch {
            match state.history.push(snapshot) {
                PushOutcome::Accepted => {
                    let view = state
                        .history
                        .head()
                        .map(|head| aggregate(head, &shared.config.chart));
                    let malformed = view.as_ref().map(|v| v.malformed).unwrap_or(false);
                    if let Some(view) = view.as_ref().filter(|v| v.malformed) {
                        warn!(handle = %id, snapshot = %view.source_id, "Malformed products, aggregating as empty");
                    }
                    shared.metrics.record_accepted(malformed);
                    state.aggregate = view;
                }
                PushOutcome::Rejected { .. } => shared.metrics.record_rejected(),
            }
        }
    }

    if state.phase != SubscriptionPhase::Live {
        info!(handle = %id, previous = ?state.phase, "Subscription live");
    }
    state.phase = SubscriptionPhase::Live;
    state.stale = false;
    if let Some(active) = state.active.as_mut() {
        active.attempts = 0;
        active.last_error = None;
    }
    shared.publish(&mut state);
    drop(state);

    shared
        .metrics
        .record_apply(started.elapsed().as_nanos().min(u64::MAX as u128) as u64);
}

fn apply_error(shared: &Arc<Shared>, id: HandleId, generation: u64, err: FeedError) {
    let mut to_release: Option<ActiveSubscription> = None;
    let mut broken: Option<Unsubscribe> = None;
    let mut retry: Option<(u32, Duration, RuntimeHandle)> = None;

    {
        let mut state = lock_state(shared);
        let Some(active) = state.active_generation(id, generation) else {
            debug!(handle = %id, error = %err, "Ignoring error for a closed subscription");
            return;
        };

        let fatal = match &err {
            FeedError::PermissionDenied(reason) => Some(ViewError::PermissionDenied {
                reason: reason.clone(),
            }),
            FeedError::Transport(message) => {
                broken = active.unsubscribe.take();
                if let Some(pending) = active.retry.take() {
                    pending.abort();
                }
                active.attempts += 1;
                active.last_error = Some(err.clone());
                let attempt = active.attempts;
                let policy = &shared.config.reconnect;

                match active.runtime.clone() {
                    Some(runtime) if attempt <= policy.max_attempts => {
                        retry = Some((attempt, policy.delay_for_attempt(attempt), runtime));
                        None
                    }
                    _ => Some(ViewError::RetriesExhausted {
                        attempts: attempt - 1,
                        last_error: message.clone(),
                    }),
                }
            }
        };

        match fatal {
            Some(view_error) => {
                error!(handle = %id, error = %view_error, "Subscription failed");
                shared.metrics.record_fatal();
                to_release = state.active.take();
                state.phase = SubscriptionPhase::Closed;
                state.error = Some(view_error);
            }
            None => {
                if let Some((attempt, delay, _)) = &retry {
                    warn!(
                        handle = %id,
                        attempt = *attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Feed transport failure, reconnecting"
                    );
                    shared.metrics.record_reconnect_attempt();
                    state.phase = SubscriptionPhase::Reconnecting { attempt: *attempt };
                }
                state.stale = true;
            }
        }
        shared.publish(&mut state);
    }

    if let Some(unsubscribe) = broken {
        unsubscribe.call();
    }
    if let Some(active) = to_release {
        active.release();
    }
    if let Some((attempt, delay, runtime)) = retry {
        schedule_reconnect(shared, id, attempt, delay, runtime);
    }
}

fn schedule_reconnect(
    shared: &Arc<Shared>,
    id: HandleId,
    attempt: u32,
    delay: Duration,
    runtime: RuntimeHandle,
) {
    let weak = Arc::downgrade(shared);
    let task = runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            reconnect(&shared, id, attempt);
        }
    });

    let mut state = lock_state(shared);
    match state.active.as_mut().filter(|a| a.id == id && a.attempts == attempt) {
        Some(active) => active.retry = Some(task.abort_handle()),
        None => task.abort(),
    }
}

fn reconnect(shared: &Arc<Shared>, id: HandleId, attempt: u32) {
    let (query, generation, stale_registration) = {
        let mut state = lock_state(shared);
        let Some(active) = state.active.as_mut().filter(|a| a.id == id && a.attempts == attempt) else {
            return;
        };
        active.retry = None;
        active.generation += 1;
        (active.query.clone(), active.generation, active.unsubscribe.take())
    };

    if let Some(unsubscribe) = stale_registration {
        unsubscribe.call();
    }

    info!(handle = %id, attempt, "Resubscribing to feed");
    register(shared, id, generation, &query);
}
