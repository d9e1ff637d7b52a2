use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::principal::{Identity, Session};
use super::provider::IdentityProvider;
use super::resolver::RoleResolver;
use crate::error::GateError;
use crate::notify::{Notifier, Subscription};

/// Immutable view of the session store at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session: Option<Session>,
    /// True until the provider's first event arrives.
    pub loading: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Loading,
    Anonymous,
    Authenticated,
}

impl SessionSnapshot {
    pub fn loading() -> Self { Self { session: None, loading: true, generation: 0 } }

    pub fn identity(&self) -> Option<&Identity> { self.session.as_ref().map(|s| &s.identity) }

    pub fn status(&self) -> SessionStatus {
        match (&self.session, self.loading) {
            (_, true) => SessionStatus::Loading,
            (None, false) => SessionStatus::Anonymous,
            (Some(_), false) => SessionStatus::Authenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool { self.status() == SessionStatus::Authenticated }
}

/// Default wait for the provider to echo a sign-in or sign-out on its event stream.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Single source of truth for who, if anyone, is signed in.
///
/// The provider's event stream is authoritative: sign-in and sign-out wait for the
/// listener to apply the matching event so transitions keep the provider's order.
/// Each transition bumps the generation, invalidates the previous identity's cached
/// role, then notifies subscribers.
pub struct SessionStore {
    provider: Arc<dyn IdentityProvider>,
    resolver: Arc<RoleResolver>,
    state: watch::Sender<SessionSnapshot>,
    events: Notifier<SessionSnapshot>,
    listener: Mutex<Option<JoinHandle<()>>>,
    confirm_timeout: Duration,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn IdentityProvider>, resolver: Arc<RoleResolver>) -> Arc<Self> {
        Self::with_confirm_timeout(provider, resolver, DEFAULT_CONFIRM_TIMEOUT)
    }

    pub fn with_confirm_timeout(
        provider: Arc<dyn IdentityProvider>,
        resolver: Arc<RoleResolver>,
        confirm_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionSnapshot::loading());
        Arc::new(Self {
            provider,
            resolver,
            state,
            events: Notifier::new(),
            listener: Mutex::new(None),
            confirm_timeout,
        })
    }

    /// Start listening to the provider's event stream. Calling it twice is a no-op.
    pub fn init(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stream = self.provider.events();
        *listener = Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(store) = weak.upgrade() else { return };
                match event {
                    Ok(identity) => {
                        store.apply(identity, "provider_event");
                    }
                    Err(e) => {
                        warn!(target: "classgate::session", "provider stream error, going anonymous: {}", e.0);
                        store.apply(None, "provider_error");
                        return;
                    }
                }
            }
            if let Some(store) = weak.upgrade() {
                debug!(target: "classgate::session", "provider stream closed");
                store.apply(None, "provider_closed");
            }
        }));
        debug!(target: "classgate::session", "listening for provider events");
    }

    /// Stop listening. The last snapshot stays readable.
    pub fn teardown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
            debug!(target: "classgate::session", "teardown");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot { self.state.borrow().clone() }

    /// Wait until the provider's first event has been applied.
    pub async fn ready(&self) -> SessionSnapshot {
        let mut rx = self.state.subscribe();
        let ready = rx.wait_for(|s| !s.loading).await.map(|s| s.clone());
        ready.unwrap_or_else(|_| self.snapshot())
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Ask the provider to sign out; the store goes anonymous once it confirms.
    pub async fn sign_out(&self) -> Result<(), GateError> {
        self.provider.sign_out().await?;
        self.confirm(None, "sign_out").await;
        Ok(())
    }

    /// Bind the identity the provider just confirmed. Returns the resulting session.
    pub(crate) async fn establish(&self, identity: Identity) -> Option<Session> {
        self.confirm(Some(identity), "sign_in").await;
        self.state.borrow().session.clone()
    }

    /// Drop the local session without waiting for the provider.
    pub(crate) fn clear_local(&self, cause: &'static str) { self.apply(None, cause); }

    fn is_listening(&self) -> bool {
        self.listener.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Wait for the listener to apply `target`; apply it directly when nobody is
    /// listening or the provider never echoes the change.
    async fn confirm(&self, target: Option<Identity>, cause: &'static str) {
        if self.is_listening() {
            let wanted = target.as_ref().map(|i| i.id.clone());
            let mut rx = self.state.subscribe();
            let seen = tokio::time::timeout(self.confirm_timeout, async {
                rx.wait_for(|s| !s.loading && s.identity().map(|i| &i.id) == wanted.as_ref()).await.is_ok()
            })
            .await
            .unwrap_or(false);
            if seen {
                return;
            }
            warn!(target: "classgate::session", "provider did not confirm {} within {:?}; applying locally", cause, self.confirm_timeout);
        }
        self.apply(target, cause);
    }

    fn apply(&self, identity: Option<Identity>, cause: &'static str) -> bool {
        let mut previous: Option<Identity> = None;
        let resolver = &self.resolver;
        let changed = self.state.send_if_modified(|state| {
            let current_id = state.session.as_ref().map(|s| s.identity.id.as_str());
            let next_id = identity.as_ref().map(|i| i.id.as_str());
            if !state.loading && current_id == next_id {
                return false;
            }
            previous = state.session.take().map(|s| s.identity);
            state.loading = false;
            state.generation = resolver.advance_generation();
            state.session = identity.clone().map(Session::new);
            true
        });
        if !changed {
            return false;
        }
        let snapshot = self.snapshot();
        match snapshot.identity() {
            Some(i) => info!(
                target: "classgate::session",
                "authenticated identity={} email={} cause={} generation={}",
                i.id, i.email, cause, snapshot.generation
            ),
            None => info!(target: "classgate::session", "anonymous cause={} generation={}", cause, snapshot.generation),
        }
        if let Some(prev) = previous {
            self.resolver.invalidate(&prev.id);
        }
        self.events.publish(snapshot);
        true
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Role, RoleResolution};
    use crate::memory::{MemoryIdentityProvider, MemoryProfileStore};

    fn store() -> (Arc<MemoryIdentityProvider>, Arc<RoleResolver>, Arc<SessionStore>) {
        let profiles = Arc::new(MemoryProfileStore::default());
        let provider = Arc::new(MemoryIdentityProvider::new(profiles.clone(), 6));
        let resolver = Arc::new(RoleResolver::new(profiles));
        let session = SessionStore::new(provider.clone(), resolver.clone());
        (provider, resolver, session)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn loading_until_first_event() {
        let (_provider, _resolver, session) = store();
        assert_eq!(session.snapshot().status(), SessionStatus::Loading);
        session.init();
        settle().await;
        assert_eq!(session.snapshot().status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn restores_existing_session_at_startup() {
        let (provider, _resolver, session) = store();
        provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        provider.sign_in_direct("t@school.test");
        session.init();
        settle().await;
        let snap = session.snapshot();
        assert_eq!(snap.identity().map(|i| i.email.as_str()), Some("t@school.test"));
    }

    #[tokio::test]
    async fn provider_error_is_terminal_anonymous() {
        let (provider, _resolver, session) = store();
        provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        session.init();
        settle().await;
        provider.sign_in_direct("t@school.test");
        settle().await;
        assert!(session.snapshot().is_authenticated());
        provider.break_stream("token refresh failed");
        settle().await;
        assert_eq!(session.snapshot().status(), SessionStatus::Anonymous);
        // Listener stopped: later provider events no longer apply.
        provider.sign_in_direct("t@school.test");
        settle().await;
        assert_eq!(session.snapshot().status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn token_expiry_goes_anonymous() {
        let (provider, _resolver, session) = store();
        provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        provider.sign_in_direct("t@school.test");
        session.init();
        settle().await;
        assert!(session.snapshot().is_authenticated());
        provider.expire_session();
        settle().await;
        assert_eq!(session.snapshot().status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn same_identity_is_not_a_transition() {
        let (provider, _resolver, session) = store();
        let ident = provider.seed_account("s@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = seen.clone();
        let _sub = session.subscribe(move |_| *seen2.lock() += 1);
        // Not listening: establish applies directly.
        assert!(session.establish(ident.clone()).await.is_some());
        let generation = session.snapshot().generation;
        session.establish(ident).await;
        assert_eq!(session.snapshot().generation, generation);
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn sign_out_waits_for_provider_and_clears_role() {
        let (provider, resolver, session) = store();
        provider.seed_account("s@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        session.init();
        settle().await;
        let ident = provider.sign_in_direct("s@school.test").expect("seeded account");
        session.establish(ident.clone()).await;
        assert_eq!(resolver.resolve(&ident.id).await.role(), Some(Role::Student));
        session.sign_out().await.expect("sign out");
        assert!(!session.snapshot().is_authenticated());
        assert_eq!(resolver.resolution(&ident.id), RoleResolution::NotFetched);
    }

    #[tokio::test]
    async fn unsubscribed_callback_is_not_called() {
        let (provider, _resolver, session) = store();
        let ident = provider.seed_account("s@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = session.subscribe(move |snap: &SessionSnapshot| seen2.lock().push(snap.status()));
        session.establish(ident).await;
        sub.unsubscribe();
        session.clear_local("test");
        assert_eq!(*seen.lock(), vec![SessionStatus::Authenticated]);
    }
}
