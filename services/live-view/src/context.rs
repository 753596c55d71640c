//! View context
//!
//! One screen's live view: a [`SubscriptionManager`] for the data, the shared
//! [`SessionResolver`] for the caller's role, and a [`RoleGate`] in between.
//! Screens read the current view synchronously and watch for updates.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use types::errors::ViewError;
use types::ids::HandleId;
use types::session::{Role, Session};

use crate::config::ViewConfig;
use crate::feed::{QueryDescriptor, SnapshotFeed};
use crate::role_gate::{PresentedView, RoleGate};
use crate::session::SessionResolver;
use crate::subscription::{LiveState, SubscriptionHandle, SubscriptionManager, SubscriptionPhase};

/// Everything a screen renders for one caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextView {
    pub display_name: String,
    pub role: Role,
    pub view: PresentedView,
    pub phase: SubscriptionPhase,
    pub stale: bool,
    pub error: Option<ViewError>,
}

/// Live view of one screen.
pub struct ViewContext {
    manager: SubscriptionManager,
    resolver: Arc<SessionResolver>,
    gate: RoleGate,
    query: Mutex<Option<QueryDescriptor>>,
    /// Handle whose permission-denied closure already invalidated the session.
    denial_handled: Mutex<Option<HandleId>>,
}

impl ViewContext {
    pub fn new(feed: Arc<dyn SnapshotFeed>, resolver: Arc<SessionResolver>, config: ViewConfig) -> Self {
        let gate = RoleGate::from_config(&config);
        Self {
            manager: SubscriptionManager::new(feed, config),
            resolver,
            gate,
            query: Mutex::new(None),
            denial_handled: Mutex::new(None),
        }
    }

    /// Subscribe to the latest snapshot (summary and statistics screens).
    pub async fn open_summary(&self) -> Result<SubscriptionHandle, ViewError> {
        let query = QueryDescriptor::latest(self.manager.config().collection.clone());
        self.open(query).await
    }

    /// Subscribe to the most recent snapshots (history screen).
    pub async fn open_history(&self) -> Result<SubscriptionHandle, ViewError> {
        let query = QueryDescriptor::recent(
            self.manager.config().collection.clone(),
            self.manager.config().history_capacity,
        );
        self.open(query).await
    }

    /// Open `query`, replacing any current subscription.
    pub async fn open(&self, query: QueryDescriptor) -> Result<SubscriptionHandle, ViewError> {
        *self.query.lock().unwrap_or_else(|p| p.into_inner()) = Some(query.clone());
        let result = self.manager.open(query).await;
        if let Err(ViewError::PermissionDenied { .. }) = &result {
            self.resolver.invalidate();
        }
        result
    }

    /// Reopen the last opened query, e.g. after the caller signed in again.
    pub async fn reopen(&self) -> Result<Option<SubscriptionHandle>, ViewError> {
        let query = self.query.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match query {
            Some(query) => {
                info!(collection = %query.collection, "Reopening view context");
                self.open(query).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Release the current subscription, if any.
    pub fn close(&self) -> bool {
        self.manager.close_current()
    }

    /// Current view for the resolved caller.
    ///
    /// After a permission-denied closure the caller is presented as an
    /// employee, and the cached session is dropped once per denied handle.
    pub async fn current_view(&self) -> ContextView {
        let session = self.resolver.current().await;
        let state = self.manager.state();

        if matches!(state.error, Some(ViewError::PermissionDenied { .. })) {
            let first_time = {
                let mut handled = self.denial_handled.lock().unwrap_or_else(|p| p.into_inner());
                let first_time = *handled != state.handle;
                *handled = state.handle;
                first_time
            };
            if first_time {
                warn!(uid = ?session.uid, "Feed access denied, presenting as employee");
                self.resolver.invalidate();
            }
        }
        self.present(&state, &session)
    }

    /// Current view for an already resolved session, answered from memory.
    pub fn view_for(&self, session: &Session) -> ContextView {
        self.present(&self.manager.state(), session)
    }

    fn present(&self, state: &LiveState, session: &Session) -> ContextView {
        if matches!(state.error, Some(ViewError::PermissionDenied { .. })) {
            let downgraded = Session {
                role: Role::Employee,
                ..session.clone()
            };
            return self.render(state, &downgraded);
        }
        self.render(state, session)
    }

    fn render(&self, state: &LiveState, session: &Session) -> ContextView {
        let view = self.gate.view(state.aggregate.as_ref(), &state.history, session);
        ContextView {
            display_name: session.display_name.clone(),
            role: session.role,
            view,
            phase: state.phase,
            stale: state.stale,
            error: state.error.clone(),
        }
    }

    /// Raw state changes of the underlying subscription.
    pub fn updates(&self) -> watch::Receiver<Arc<LiveState>> {
        self.manager.updates()
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    pub fn resolver(&self) -> &Arc<SessionResolver> {
        &self.resolver
    }
}
