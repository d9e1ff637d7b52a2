//! Wires the session store and the role resolver together and publishes one
//! consistent [`GateView`] per change.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use super::gate::{decide, GateVariant};
use super::resolver::{RoleEvent, RoleResolution, RoleResolver};
use super::session::{SessionSnapshot, SessionStore};
use crate::notify::{Notifier, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateView {
    pub snapshot: SessionSnapshot,
    #[serde(serialize_with = "serialize_resolution")]
    pub resolution: RoleResolution,
    pub variant: GateVariant,
}

fn serialize_resolution<S: serde::Serializer>(r: &RoleResolution, s: S) -> Result<S::Ok, S::Error> {
    let text = match r {
        RoleResolution::NotFetched => "not_fetched".to_string(),
        RoleResolution::Fetching => "fetching".to_string(),
        RoleResolution::Resolved(role) => role.as_str().to_string(),
        RoleResolution::Failed(e) => format!("failed:{}", e.code_str()),
    };
    s.serialize_str(&text)
}

pub struct GateCoordinator {
    session: Arc<SessionStore>,
    resolver: Arc<RoleResolver>,
    latest: watch::Sender<GateView>,
    views: Notifier<GateView>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl GateCoordinator {
    pub fn new(session: Arc<SessionStore>, resolver: Arc<RoleResolver>) -> Arc<Self> {
        let initial = compute(&session, &resolver);
        let (latest, _) = watch::channel(initial);
        Arc::new(Self { session, resolver, latest, views: Notifier::new(), subscriptions: Mutex::new(Vec::new()) })
    }

    pub fn session(&self) -> &Arc<SessionStore> { &self.session }

    pub fn resolver(&self) -> &Arc<RoleResolver> { &self.resolver }

    /// Subscribe to both stores and start the session listener.
    pub fn start(self: &Arc<Self>) {
        let mut subs = self.subscriptions.lock();
        if !subs.is_empty() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        subs.push(self.session.subscribe({
            let weak = weak.clone();
            move |snapshot: &SessionSnapshot| {
                if let Some(this) = weak.upgrade() {
                    this.on_session(snapshot);
                }
            }
        }));
        subs.push(self.resolver.subscribe(move |event: &RoleEvent| {
            if let Some(this) = weak.upgrade() {
                this.on_role(event);
            }
        }));
        drop(subs);
        self.session.init();
        let snapshot = self.session.snapshot();
        self.on_session(&snapshot);
    }

    pub fn shutdown(&self) {
        self.subscriptions.lock().clear();
        self.session.teardown();
    }

    /// Current view computed from both stores. A cached resolution that belongs to
    /// an identity other than the current one never leaks in.
    pub fn view(&self) -> GateView { compute(&self.session, &self.resolver) }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GateView) + Send + Sync + 'static,
    {
        self.views.subscribe(callback)
    }

    /// Wait for the session to load and the current identity's role to settle.
    pub async fn settled(&self) -> GateView {
        let snapshot = self.session.ready().await;
        if let Some(identity) = snapshot.identity() {
            self.resolver.resolve(&identity.id).await;
        }
        self.view()
    }

    fn on_session(&self, snapshot: &SessionSnapshot) {
        self.refresh();
        let Some(identity) = snapshot.identity() else { return };
        if self.resolver.resolution(&identity.id).is_settled() {
            return;
        }
        let Ok(handle) = Handle::try_current() else { return };
        let resolver = self.resolver.clone();
        let id = identity.id.clone();
        handle.spawn(async move {
            resolver.resolve(&id).await;
        });
    }

    fn on_role(&self, event: &RoleEvent) {
        let current = self.session.snapshot();
        if current.identity().map(|i| i.id.as_str()) != Some(event.identity_id.as_str()) {
            return;
        }
        self.refresh();
    }

    fn refresh(&self) {
        let mut published = None;
        self.latest.send_if_modified(|latest| {
            let next = compute(&self.session, &self.resolver);
            if *latest == next {
                return false;
            }
            *latest = next.clone();
            published = Some(next);
            true
        });
        if let Some(view) = published {
            debug!(target: "classgate::session", "gate view variant={:?} generation={}", view.variant, view.snapshot.generation);
            self.views.publish(view);
        }
    }
}

impl Drop for GateCoordinator {
    fn drop(&mut self) { self.subscriptions.get_mut().clear(); }
}

fn compute(session: &SessionStore, resolver: &RoleResolver) -> GateView {
    let snapshot = session.snapshot();
    let resolution = snapshot
        .identity()
        .map(|i| resolver.resolution(&i.id))
        .unwrap_or(RoleResolution::NotFetched);
    let variant = decide(&snapshot, &resolution);
    GateView { snapshot, resolution, variant }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::memory::{MemoryIdentityProvider, MemoryProfileStore};

    fn coordinator() -> (Arc<MemoryIdentityProvider>, Arc<GateCoordinator>) {
        let profiles = Arc::new(MemoryProfileStore::default());
        let provider = Arc::new(MemoryIdentityProvider::new(profiles.clone(), 6));
        let resolver = Arc::new(RoleResolver::new(profiles));
        let session = SessionStore::new(provider.clone(), resolver.clone());
        (provider, GateCoordinator::new(session, resolver))
    }

    #[tokio::test]
    async fn starts_loading_then_unauthenticated() {
        let (_provider, gate) = coordinator();
        assert_eq!(gate.view().variant, GateVariant::Loading);
        gate.start();
        assert_eq!(gate.settled().await.variant, GateVariant::Unauthenticated);
    }

    #[tokio::test]
    async fn resolves_role_after_sign_in() {
        let (provider, gate) = coordinator();
        provider.seed_account("t@school.test", "secret1", "Tess", Role::Admin, None).expect("seed");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = gate.subscribe(move |v: &GateView| seen2.lock().push(v.variant));
        gate.start();
        gate.settled().await;
        provider.sign_in_direct("t@school.test");
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.view().variant, GateVariant::StaffOrAdmin);
        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&GateVariant::StaffOrAdmin));
        assert!(seen.contains(&GateVariant::Unauthenticated));
    }

    #[tokio::test]
    async fn view_ignores_other_identity_cache() {
        let (provider, gate) = coordinator();
        let other = provider.seed_account("s@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        gate.start();
        gate.settled().await;
        gate.resolver().resolve(&other.id).await;
        let view = gate.view();
        assert_eq!(view.variant, GateVariant::Unauthenticated);
        assert_eq!(view.resolution, RoleResolution::NotFetched);
    }
}
