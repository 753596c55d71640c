//! Session resolution
//!
//! Resolves the caller's role once per identity from the auth and profile
//! collaborators and caches it until logout, a sign-out signal, or an
//! identity change. Resolution never fails: a missing identity, a missing
//! profile, or a denied profile read all resolve to `employee`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::errors::ProfileError;
use types::ids::UserId;
use types::session::{Identity, Profile, Session};

/// Notification from the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
}

/// Authentication provider as seen by the live view.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;

    /// Stream of sign-in / sign-out notifications.
    fn events(&self) -> broadcast::Receiver<AuthEvent>;

    async fn sign_out(&self);
}

/// Profile records keyed by identity.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// `Ok(None)` when no record exists for the identity.
    async fn get_profile(&self, identity: &Identity) -> Result<Option<Profile>, ProfileError>;
}

#[derive(Default)]
struct SessionCache {
    /// Bumped on every invalidation; a resolution started under an older
    /// epoch is returned to its caller but never cached.
    epoch: u64,
    entry: Option<(UserId, Arc<Session>)>,
}

/// Resolves and caches the caller's session.
pub struct SessionResolver {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    cache: RwLock<SessionCache>,
}

impl SessionResolver {
    pub fn new(auth: Arc<dyn AuthProvider>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            auth,
            profiles,
            cache: RwLock::new(SessionCache::default()),
        }
    }

    /// Resolve the session for `identity`.
    pub async fn resolve(&self, identity: Option<&Identity>) -> Arc<Session> {
        let Some(identity) = identity else {
            return Arc::new(Session::anonymous());
        };

        let epoch = {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some((uid, session)) = &cache.entry {
                if uid == &identity.uid {
                    return session.clone();
                }
            }
            cache.epoch
        };

        let session = match self.profiles.get_profile(identity).await {
            Ok(Some(profile)) => Session::from_profile(identity, &profile),
            Ok(None) => {
                warn!(uid = %identity.uid, "No profile record, defaulting to employee");
                Session::fallback(identity)
            }
            Err(err) => {
                warn!(uid = %identity.uid, error = %err, "Profile lookup failed, defaulting to employee");
                Session::fallback(identity)
            }
        };
        let session = Arc::new(session);

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        if cache.epoch == epoch {
            cache.entry = Some((identity.uid.clone(), session.clone()));
            info!(uid = %identity.uid, role = session.role.label(), "Session resolved");
        } else {
            debug!(uid = %identity.uid, "Session invalidated during resolution, not caching");
        }
        session
    }

    /// Resolve the session of the auth provider's current identity.
    pub async fn current(&self) -> Arc<Session> {
        let identity = self.auth.current_identity();
        self.resolve(identity.as_ref()).await
    }

    /// Cached session, if one is held.
    pub fn cached(&self) -> Option<Arc<Session>> {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        cache.entry.as_ref().map(|(_, session)| session.clone())
    }

    pub async fn is_admin(&self) -> bool {
        self.current().await.is_admin()
    }

    /// Drop the cached session; the next request re-resolves.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.epoch += 1;
        if let Some((uid, _)) = cache.entry.take() {
            info!(uid = %uid, "Session invalidated");
        }
    }

    /// Sign out through the auth provider and drop the cached session.
    pub async fn logout(&self) {
        self.auth.sign_out().await;
        self.invalidate();
    }

    /// Apply one auth notification to the cache.
    pub fn handle_auth_event(&self, event: &AuthEvent) {
        match event {
            AuthEvent::SignedOut => self.invalidate(),
            AuthEvent::SignedIn(identity) => {
                let same = {
                    let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
                    matches!(&cache.entry, Some((uid, _)) if uid == &identity.uid)
                };
                if !same {
                    self.invalidate();
                }
            }
        }
    }

    /// Listen for auth notifications until the provider's channel closes or
    /// the resolver is dropped.
    pub fn spawn_auth_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.auth.events();
        let resolver = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => resolver.handle_auth_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed auth notifications, invalidating session");
                        resolver.invalidate();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Auth listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAuth, MemoryProfiles};
    use types::session::Role;

    fn admin_profile() -> Profile {
        Profile {
            role: Some("admin".to_string()),
            email: Some("boss@example.com".to_string()),
            ..Profile::default()
        }
    }

    fn setup() -> (Arc<MemoryAuth>, Arc<MemoryProfiles>, Arc<SessionResolver>) {
        let auth = Arc::new(MemoryAuth::new());
        let profiles = Arc::new(MemoryProfiles::new());
        let resolver = Arc::new(SessionResolver::new(auth.clone(), profiles.clone()));
        (auth, profiles, resolver)
    }

    #[tokio::test]
    async fn test_absent_identity_is_employee() {
        let (_, _, resolver) = setup();
        let session = resolver.current().await;
        assert_eq!(session.role, Role::Employee);
        assert_eq!(session.uid, None);
        assert!(resolver.cached().is_none());
    }

    #[tokio::test]
    async fn test_admin_profile_resolves_admin() {
        let (auth, profiles, resolver) = setup();
        let identity = Identity::new("u1", Some("boss@example.com".to_string()));
        profiles.insert(&identity.uid, admin_profile());
        auth.sign_in(identity);

        let session = resolver.current().await;
        assert!(session.is_admin());
        assert_eq!(session.display_name, "boss");
        assert!(resolver.is_admin().await);
    }

    #[tokio::test]
    async fn test_missing_or_denied_profile_fails_closed() {
        let (auth, profiles, resolver) = setup();
        auth.sign_in(Identity::new("ghost", None));
        assert_eq!(resolver.current().await.role, Role::Employee);

        let denied = Identity::new("locked", None);
        profiles.insert(&denied.uid, admin_profile());
        profiles.deny(&denied.uid);
        resolver.invalidate();
        assert_eq!(resolver.resolve(Some(&denied)).await.role, Role::Employee);
    }

    #[tokio::test]
    async fn test_session_cached_per_identity() {
        let (auth, profiles, resolver) = setup();
        let identity = Identity::new("u1", None);
        profiles.insert(&identity.uid, admin_profile());
        auth.sign_in(identity);

        resolver.current().await;
        resolver.current().await;
        assert_eq!(profiles.lookups(), 1);

        resolver.invalidate();
        resolver.current().await;
        assert_eq!(profiles.lookups(), 2);
    }

    #[tokio::test]
    async fn test_identity_change_invalidates() {
        let (_, profiles, resolver) = setup();
        let first = Identity::new("u1", None);
        profiles.insert(&first.uid, admin_profile());
        resolver.resolve(Some(&first)).await;

        resolver.handle_auth_event(&AuthEvent::SignedIn(first.clone()));
        assert!(resolver.cached().is_some());

        resolver.handle_auth_event(&AuthEvent::SignedIn(Identity::new("u2", None)));
        assert!(resolver.cached().is_none());
    }

    #[tokio::test]
    async fn test_logout_clears_cache_and_identity() {
        let (auth, profiles, resolver) = setup();
        let identity = Identity::new("u1", None);
        profiles.insert(&identity.uid, admin_profile());
        auth.sign_in(identity);
        assert!(resolver.current().await.is_admin());

        resolver.logout().await;
        assert!(resolver.cached().is_none());
        assert_eq!(resolver.current().await.role, Role::Employee);
    }

    #[tokio::test]
    async fn test_auth_listener_invalidates_on_sign_out() {
        let (auth, profiles, resolver) = setup();
        let identity = Identity::new("u1", None);
        profiles.insert(&identity.uid, admin_profile());
        auth.sign_in(identity);
        resolver.current().await;

        let listener = resolver.spawn_auth_listener();
        auth.sign_out().await;

        for _ in 0..50 {
            if resolver.cached().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(resolver.cached().is_none());
        listener.abort();
    }
}
