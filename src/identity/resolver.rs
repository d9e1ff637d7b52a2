//! Role resolution with a per-identity cache.
//!
//! Each identity is looked up at most once per session generation: concurrent
//! callers join one in-flight lookup through the [`MutationGuard`], and results that
//! complete after a session transition are dropped instead of cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::principal::Role;
use super::provider::ProfileStore;
use crate::error::GateError;
use crate::guard::{GuardPolicy, MutationGuard};
use crate::notify::{Notifier, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleResolution {
    NotFetched,
    Fetching,
    Resolved(Role),
    Failed(GateError),
}

impl RoleResolution {
    pub fn is_settled(&self) -> bool { matches!(self, RoleResolution::Resolved(_) | RoleResolution::Failed(_)) }

    pub fn role(&self) -> Option<Role> {
        match self {
            RoleResolution::Resolved(r) => Some(*r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleEvent {
    pub identity_id: String,
    pub resolution: RoleResolution,
}

pub struct RoleResolver {
    profiles: Arc<dyn ProfileStore>,
    cache: Mutex<HashMap<String, RoleResolution>>,
    generation: AtomicU64,
    lookups: MutationGuard<Role>,
    events: Notifier<RoleEvent>,
}

impl RoleResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            cache: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            lookups: MutationGuard::new("role_lookup"),
            events: Notifier::new(),
        }
    }

    pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }

    /// Called by the session store on every transition. Lookups started under an
    /// older generation are discarded when they complete.
    pub(crate) fn advance_generation(&self) -> u64 { self.generation.fetch_add(1, Ordering::AcqRel) + 1 }

    /// Cached state for an identity, without fetching.
    pub fn resolution(&self, identity_id: &str) -> RoleResolution {
        self.cache.lock().get(identity_id).cloned().unwrap_or(RoleResolution::NotFetched)
    }

    pub async fn resolve(&self, identity_id: &str) -> RoleResolution {
        let generation = self.generation();
        let started = {
            let mut cache = self.cache.lock();
            match cache.get(identity_id) {
                Some(r) if r.is_settled() => return r.clone(),
                Some(RoleResolution::Fetching) => false,
                _ => {
                    cache.insert(identity_id.to_string(), RoleResolution::Fetching);
                    true
                }
            }
        };
        if started {
            debug!(target: "classgate::roles", "resolve: fetching role for identity={} generation={}", identity_id, generation);
            self.publish(identity_id, RoleResolution::Fetching);
        }

        let profiles = self.profiles.clone();
        let owned_id = identity_id.to_string();
        let result = self
            .lookups
            .run(format!("{}@{}", identity_id, generation), GuardPolicy::Join, move || async move {
                profiles.get_role(&owned_id).await.map_err(GateError::from)
            })
            .await;

        if self.generation() != generation {
            debug!(
                target: "classgate::roles",
                "resolve: discarding stale result for identity={} (generation {} -> {})",
                identity_id, generation, self.generation()
            );
            return RoleResolution::NotFetched;
        }

        let resolution = match result {
            Ok(role) => RoleResolution::Resolved(role),
            Err(e) => RoleResolution::Failed(e),
        };
        {
            let mut cache = self.cache.lock();
            match cache.get(identity_id) {
                Some(RoleResolution::Fetching) => {
                    cache.insert(identity_id.to_string(), resolution.clone());
                }
                // A joined caller already wrote it, or it was invalidated meanwhile.
                Some(existing) if existing.is_settled() => return existing.clone(),
                _ => return RoleResolution::NotFetched,
            }
        }
        match &resolution {
            RoleResolution::Resolved(role) => info!(target: "classgate::roles", "identity={} role={}", identity_id, role),
            RoleResolution::Failed(e) => warn!(target: "classgate::roles", "identity={} role lookup failed: {}", identity_id, e),
            _ => {}
        }
        self.publish(identity_id, resolution.clone());
        resolution
    }

    /// Forget the cached state so the next `resolve` fetches again.
    pub fn invalidate(&self, identity_id: &str) -> bool {
        let removed = self.cache.lock().remove(identity_id).is_some();
        if removed {
            debug!(target: "classgate::roles", "invalidate identity={}", identity_id);
            self.publish(identity_id, RoleResolution::NotFetched);
        }
        removed
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RoleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    fn publish(&self, identity_id: &str, resolution: RoleResolution) {
        self.events.publish(RoleEvent { identity_id: identity_id.to_string(), resolution });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProfileStore;

    fn store_with(id: &str, role: Role) -> Arc<MemoryProfileStore> {
        let store = Arc::new(MemoryProfileStore::default());
        store.insert_role(id, role);
        store
    }

    #[tokio::test]
    async fn caches_resolved_role() {
        let store = store_with("u1", Role::Teacher);
        let resolver = RoleResolver::new(store.clone());
        assert_eq!(resolver.resolution("u1"), RoleResolution::NotFetched);
        assert_eq!(resolver.resolve("u1").await, RoleResolution::Resolved(Role::Teacher));
        assert_eq!(resolver.resolve("u1").await, RoleResolution::Resolved(Role::Teacher));
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_lookup() {
        let store = store_with("u1", Role::Student);
        let hold = store.hold("u1");
        let resolver = Arc::new(RoleResolver::new(store.clone()));
        let (r1, r2) = (resolver.clone(), resolver.clone());
        let a = tokio::spawn(async move { r1.resolve("u1").await });
        let b = tokio::spawn(async move { r2.resolve("u1").await });
        tokio::task::yield_now().await;
        assert_eq!(resolver.resolution("u1"), RoleResolution::Fetching);
        hold.release();
        assert_eq!(a.await.ok(), Some(RoleResolution::Resolved(Role::Student)));
        assert_eq!(b.await.ok(), Some(RoleResolution::Resolved(Role::Student)));
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn failure_is_cached_until_invalidated() {
        let store = Arc::new(MemoryProfileStore::default());
        let resolver = RoleResolver::new(store.clone());
        let first = resolver.resolve("ghost").await;
        assert!(matches!(first, RoleResolution::Failed(GateError::ProfileFetchFailed { .. })), "{:?}", first);
        store.insert_role("ghost", Role::Admin);
        assert_eq!(resolver.resolve("ghost").await, first);
        assert!(resolver.invalidate("ghost"));
        assert_eq!(resolver.resolve("ghost").await, RoleResolution::Resolved(Role::Admin));
        assert_eq!(store.lookup_count(), 2);
    }

    #[tokio::test]
    async fn stale_generation_is_not_cached() {
        let store = store_with("a", Role::Student);
        let hold = store.hold("a");
        let resolver = Arc::new(RoleResolver::new(store.clone()));
        let r = resolver.clone();
        let pending = tokio::spawn(async move { r.resolve("a").await });
        tokio::task::yield_now().await;
        resolver.advance_generation();
        resolver.invalidate("a");
        hold.release();
        assert_eq!(pending.await.ok(), Some(RoleResolution::NotFetched));
        assert_eq!(resolver.resolution("a"), RoleResolution::NotFetched);
    }
}
