//! In-memory collaborators: identity provider, profile store and notebook store.
//!
//! Used by the dev server and by tests. The provider hashes passwords with Argon2
//! and reports failures with the same phrases a hosted auth backend uses, so the
//! classification path is the one production traffic takes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use password_hash::{PasswordHash, SaltString};
use regex::Regex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::{
    AuthEvent, Identity, IdentityProvider, Profile, ProfileError, ProfileMetadata, ProfileStore, ProviderError, Role,
    SignInError, SignUpError,
};
use crate::resources::{Notebook, NotebookDraft, ResourceStore, StoreError};

static EMAIL_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// Holds back an operation until released (or dropped).
pub struct Hold {
    tx: watch::Sender<bool>,
}

impl Hold {
    pub fn release(self) { let _ = self.tx.send(true); }
}

#[derive(Default)]
struct Gate {
    rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl Gate {
    fn hold(&self) -> Hold {
        let (tx, rx) = watch::channel(false);
        *self.rx.lock() = Some(rx);
        Hold { tx }
    }

    async fn pass(&self) {
        let rx = self.rx.lock().clone();
        if let Some(mut rx) = rx {
            // A dropped hold releases as well.
            let _ = rx.wait_for(|open| *open).await;
        }
    }
}

fn hasher() -> Result<Argon2<'static>, String> {
    let params = Params::new(4096, 1, 1, None).map_err(|e| e.to_string())?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

fn hash_password(password: &str) -> Result<String, String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| e.to_string())?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| e.to_string())?;
    let phc = hasher()?.hash_password(password.as_bytes(), &salt).map_err(|e| e.to_string())?.to_string();
    Ok(phc)
}

fn verify_password(hash: &str, password: &str) -> bool {
    match (PasswordHash::new(hash), hasher()) {
        (Ok(parsed), Ok(argon2)) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
        _ => false,
    }
}

struct Account {
    identity: Identity,
    password_hash: String,
    confirmed: bool,
}

pub struct MemoryIdentityProvider {
    profiles: Arc<MemoryProfileStore>,
    min_password_len: usize,
    accounts: Mutex<HashMap<String, Account>>,
    current: Mutex<Option<Identity>>,
    events: broadcast::Sender<AuthEvent>,
    require_confirmation: AtomicBool,
    sign_in_gate: Gate,
}

impl MemoryIdentityProvider {
    pub fn new(profiles: Arc<MemoryProfileStore>, min_password_len: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            profiles,
            min_password_len,
            accounts: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            events,
            require_confirmation: AtomicBool::new(false),
            sign_in_gate: Gate::default(),
        }
    }

    /// Create a confirmed account with its profile row.
    pub fn seed_account(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
        role: Role,
        student_id: Option<&str>,
    ) -> Result<Identity, ProviderError> {
        let metadata = ProfileMetadata::new(full_name, role, student_id.map(str::to_string));
        self.register(email, password, metadata, true).map_err(|e| match e {
            SignUpError::Other(m) => ProviderError(m),
            other => ProviderError(format!("{:?}", other)),
        })
    }

    /// New sign-ups must confirm their email before signing in.
    pub fn require_confirmation(&self, on: bool) { self.require_confirmation.store(on, Ordering::Relaxed); }

    pub fn confirm_email(&self, email: &str) -> bool {
        match self.accounts.lock().get_mut(&email.trim().to_lowercase()) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Sign in without a password, as a restored or externally refreshed session would.
    pub fn sign_in_direct(&self, email: &str) -> Option<Identity> {
        let identity = self.accounts.lock().get(&email.trim().to_lowercase()).map(|a| a.identity.clone())?;
        self.set_current(Some(identity.clone()));
        Some(identity)
    }

    /// The provider drops the session on its own (token expiry).
    pub fn expire_session(&self) { self.set_current(None); }

    /// Emit an error on the event stream.
    pub fn break_stream(&self, message: &str) {
        let _ = self.events.send(Err(ProviderError(message.to_string())));
    }

    pub fn hold_sign_in(&self) -> Hold { self.sign_in_gate.hold() }

    pub fn current(&self) -> Option<Identity> { self.current.lock().clone() }

    fn set_current(&self, identity: Option<Identity>) {
        *self.current.lock() = identity.clone();
        let _ = self.events.send(Ok(identity));
    }

    fn register(
        &self,
        email: &str,
        password: &str,
        metadata: ProfileMetadata,
        confirmed: bool,
    ) -> Result<Identity, SignUpError> {
        let email = email.trim().to_lowercase();
        if !EMAIL_RE.as_ref().is_some_and(|re| re.is_match(&email)) {
            return Err(SignUpError::from_message("Unable to validate email address: invalid format"));
        }
        if password.chars().count() < self.min_password_len {
            return Err(SignUpError::from_message(&format!(
                "Password should be at least {} characters",
                self.min_password_len
            )));
        }
        if self.accounts.lock().contains_key(&email) {
            return Err(SignUpError::from_message("User already registered"));
        }
        let password_hash = hash_password(password).map_err(SignUpError::Other)?;
        let identity = Identity { id: Uuid::new_v4().to_string(), email: email.clone() };
        {
            let mut accounts = self.accounts.lock();
            if accounts.contains_key(&email) {
                return Err(SignUpError::from_message("User already registered"));
            }
            accounts.insert(email, Account { identity: identity.clone(), password_hash, confirmed });
        }
        self.profiles.insert(Profile {
            identity_id: identity.id.clone(),
            role: metadata.role,
            full_name: metadata.full_name,
            student_id: metadata.student_id,
        });
        debug!(target: "classgate::handshake", "memory provider registered identity={}", identity.id);
        Ok(identity)
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<Identity, SignInError>> {
        async move {
            self.sign_in_gate.pass().await;
            let key = email.trim().to_lowercase();
            let (identity, confirmed) = {
                let accounts = self.accounts.lock();
                match accounts.get(&key) {
                    Some(a) if verify_password(&a.password_hash, password) => (a.identity.clone(), a.confirmed),
                    _ => return Err(SignInError::from_message("Invalid login credentials")),
                }
            };
            if !confirmed {
                return Err(SignInError::from_message("Email not confirmed"));
            }
            self.set_current(Some(identity.clone()));
            Ok(identity)
        }
        .boxed()
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: ProfileMetadata,
    ) -> BoxFuture<'a, Result<Identity, SignUpError>> {
        async move {
            let confirmed = !self.require_confirmation.load(Ordering::Relaxed);
            self.register(email, password, metadata, confirmed)
        }
        .boxed()
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        async move {
            self.set_current(None);
            Ok(())
        }
        .boxed()
    }

    fn events(&self) -> BoxStream<'static, AuthEvent> {
        // Subscribe before reading the current identity so no change slips between.
        let rx = self.events.subscribe();
        let initial: AuthEvent = Ok(self.current());
        stream::once(async move { initial })
            .chain(stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some((event, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(target: "classgate::session", "auth event stream lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }))
            .boxed()
    }
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
    holds: Mutex<HashMap<String, Arc<Gate>>>,
    failure: Mutex<Option<String>>,
    lookups: AtomicUsize,
}

impl MemoryProfileStore {
    pub fn insert(&self, profile: Profile) { self.profiles.lock().insert(profile.identity_id.clone(), profile); }

    pub fn insert_role(&self, identity_id: &str, role: Role) {
        self.insert(Profile { identity_id: identity_id.to_string(), role, full_name: String::new(), student_id: None });
    }

    pub fn profile(&self, identity_id: &str) -> Option<Profile> { self.profiles.lock().get(identity_id).cloned() }

    /// Park lookups for `identity_id` until the returned hold is released.
    pub fn hold(&self, identity_id: &str) -> Hold {
        let gate = Arc::new(Gate::default());
        let hold = gate.hold();
        self.holds.lock().insert(identity_id.to_string(), gate);
        hold
    }

    /// Every lookup fails with `message` until cleared.
    pub fn fail_lookups(&self, message: &str) { *self.failure.lock() = Some(message.to_string()); }

    pub fn clear_failure(&self) { *self.failure.lock() = None; }

    pub fn lookup_count(&self) -> usize { self.lookups.load(Ordering::SeqCst) }
}

impl ProfileStore for MemoryProfileStore {
    fn get_role<'a>(&'a self, identity_id: &'a str) -> BoxFuture<'a, Result<Role, ProfileError>> {
        async move {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let gate = self.holds.lock().get(identity_id).cloned();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            if let Some(message) = self.failure.lock().clone() {
                return Err(ProfileError::Other(message));
            }
            self.profiles.lock().get(identity_id).map(|p| p.role).ok_or(ProfileError::NotFound)
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct MemoryResourceStore {
    notebooks: Mutex<HashMap<String, Notebook>>,
    gate: Gate,
    fail_next: Mutex<Option<String>>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryResourceStore {
    /// Park creates and deletes until released.
    pub fn hold(&self) -> Hold { self.gate.hold() }

    /// The next create or delete fails with `message`.
    pub fn fail_next(&self, message: &str) { *self.fail_next.lock() = Some(message.to_string()); }

    pub fn create_calls(&self) -> usize { self.creates.load(Ordering::SeqCst) }

    pub fn delete_calls(&self) -> usize { self.deletes.load(Ordering::SeqCst) }

    fn take_failure(&self) -> Result<(), StoreError> {
        match self.fail_next.lock().take() {
            Some(m) => Err(StoreError::Other(m)),
            None => Ok(()),
        }
    }
}

impl ResourceStore for MemoryResourceStore {
    fn create<'a>(&'a self, owner_id: &'a str, draft: NotebookDraft) -> BoxFuture<'a, Result<Notebook, StoreError>> {
        async move {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.gate.pass().await;
            self.take_failure()?;
            let now = Utc::now();
            let notebook = Notebook {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                title: draft.title,
                description: draft.description,
                created_at: now,
                updated_at: now,
            };
            self.notebooks.lock().insert(notebook.id.clone(), notebook.clone());
            Ok(notebook)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.gate.pass().await;
            self.take_failure()?;
            self.notebooks.lock().remove(id).map(|_| ()).ok_or(StoreError::NotFound)
        }
        .boxed()
    }

    fn list<'a>(&'a self, owner_id: &'a str) -> BoxFuture<'a, Result<Vec<Notebook>, StoreError>> {
        async move {
            let mut out: Vec<Notebook> =
                self.notebooks.lock().values().filter(|n| n.owner_id == owner_id).cloned().collect();
            out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
            Ok(out)
        }
        .boxed()
    }
}
