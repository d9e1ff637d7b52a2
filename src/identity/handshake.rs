//! Sign-up and sign-in attempts against the identity provider.
//!
//! One attempt at a time: `Idle -> Submitting -> Succeeded | Failed`. Role-specific
//! entry points verify the resolved role after sign-in and sign the user back out
//! when it does not satisfy the portal they came through.
//!
//! The sign-in work runs as its own task: a caller that stops waiting frees the
//! handshake, but the role check and any forced sign-out still complete.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::principal::{Credentials, Identity, ProfileMetadata, Role, Session, SignUpFields};
use super::provider::IdentityProvider;
use super::resolver::{RoleResolution, RoleResolver};
use super::session::SessionStore;
use crate::error::{GateError, GateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Idle,
    Submitting,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignUpConfirmation {
    pub identity: Identity,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignInOutcome {
    pub session: Session,
    /// Present when an expected role was verified.
    pub role: Option<Role>,
}

pub struct AuthHandshake {
    provider: Arc<dyn IdentityProvider>,
    session: Arc<SessionStore>,
    resolver: Arc<RoleResolver>,
    state: Arc<Mutex<HandshakeState>>,
}

/// Marks an attempt as submitting; an abandoned attempt drops back to Idle.
struct Submission {
    state: Arc<Mutex<HandshakeState>>,
    finished: bool,
}

impl Submission {
    fn begin(state: &Arc<Mutex<HandshakeState>>) -> GateResult<Self> {
        let mut s = state.lock();
        if *s == HandshakeState::Submitting {
            return Err(GateError::HandshakeBusy);
        }
        *s = HandshakeState::Submitting;
        Ok(Self { state: state.clone(), finished: false })
    }

    fn finish<T>(mut self, result: GateResult<T>) -> GateResult<T> {
        *self.state.lock() = if result.is_ok() { HandshakeState::Succeeded } else { HandshakeState::Failed };
        self.finished = true;
        result
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = HandshakeState::Idle;
        }
    }
}

impl AuthHandshake {
    pub fn new(provider: Arc<dyn IdentityProvider>, session: Arc<SessionStore>, resolver: Arc<RoleResolver>) -> Self {
        Self { provider, session, resolver, state: Arc::new(Mutex::new(HandshakeState::Idle)) }
    }

    pub fn state(&self) -> HandshakeState { *self.state.lock() }

    /// Register a new account. Does not sign in.
    pub async fn sign_up(&self, fields: SignUpFields, role_hint: Role) -> GateResult<SignUpConfirmation> {
        let submission = Submission::begin(&self.state)?;
        if role_hint == Role::Unknown {
            warn!(target: "classgate::handshake", "sign_up refused: role {} is not registrable", role_hint);
            return submission.finish(Err(GateError::UnsupportedRole { role: role_hint }));
        }
        let metadata = ProfileMetadata::new(fields.full_name, role_hint, fields.student_id);
        let email = fields.credentials.email.trim().to_string();
        debug!(target: "classgate::handshake", "sign_up email={} role={}", email, role_hint);
        let result = self
            .provider
            .sign_up(&email, &fields.credentials.password, metadata)
            .await
            .map(|identity| SignUpConfirmation { identity, role: role_hint })
            .map_err(GateError::from);
        match &result {
            Ok(c) => info!(target: "classgate::handshake", "signed up identity={} role={}", c.identity.id, c.role),
            Err(e) => warn!(target: "classgate::handshake", "sign_up failed email={}: {}", email, e.code_str()),
        }
        submission.finish(result)
    }

    /// Verify credentials and bind the session. With `expected`, the resolved role
    /// must satisfy that portal or the session is torn down again.
    pub async fn sign_in(&self, credentials: Credentials, expected: Option<Role>) -> GateResult<SignInOutcome> {
        let submission = Submission::begin(&self.state)?;
        let attempt = SignInAttempt {
            provider: self.provider.clone(),
            session: self.session.clone(),
            resolver: self.resolver.clone(),
        };
        let work = attempt.run(credentials, expected);
        let result = match Handle::try_current() {
            Ok(runtime) => runtime
                .spawn(work)
                .await
                .unwrap_or_else(|e| Err(GateError::provider(format!("sign-in aborted: {}", e)))),
            Err(_) => work.await,
        };
        submission.finish(result)
    }
}

struct SignInAttempt {
    provider: Arc<dyn IdentityProvider>,
    session: Arc<SessionStore>,
    resolver: Arc<RoleResolver>,
}

impl SignInAttempt {
    async fn run(self, credentials: Credentials, expected: Option<Role>) -> GateResult<SignInOutcome> {
        let email = credentials.email.trim();
        let identity = match self.provider.sign_in(email, &credentials.password).await {
            Ok(identity) => identity,
            Err(e) => {
                let e = GateError::from(e);
                warn!(target: "classgate::handshake", "sign_in rejected email={}: {}", email, e.code_str());
                return Err(e);
            }
        };
        let session = self
            .session
            .establish(identity.clone())
            .await
            .ok_or_else(|| GateError::provider("session was not established"))?;
        info!(target: "classgate::handshake", "signed in identity={}", identity.id);

        let Some(expected) = expected else {
            return Ok(SignInOutcome { session, role: None });
        };

        match self.resolver.resolve(&identity.id).await {
            RoleResolution::Resolved(role) if role.satisfies(expected) => {
                debug!(target: "classgate::handshake", "identity={} role={} satisfies {}", identity.id, role, expected);
                Ok(SignInOutcome { session, role: Some(role) })
            }
            RoleResolution::Resolved(role) => {
                warn!(
                    target: "classgate::handshake",
                    "identity={} has role={} but signed in as {}; signing out", identity.id, role, expected
                );
                self.force_sign_out(&identity).await;
                Err(GateError::RoleMismatch { expected })
            }
            RoleResolution::Failed(e) => {
                warn!(target: "classgate::handshake", "identity={} role unverifiable; signing out: {}", identity.id, e);
                self.force_sign_out(&identity).await;
                Err(e)
            }
            // The session moved on while the role was loading; nothing left to verify.
            RoleResolution::NotFetched | RoleResolution::Fetching => {
                Err(GateError::profile("session changed while verifying role"))
            }
        }
    }

    /// Sign out `identity` if it still holds the session; a newer session is left alone.
    async fn force_sign_out(&self, identity: &Identity) {
        if self.session.snapshot().identity().map(|i| &i.id) != Some(&identity.id) {
            debug!(target: "classgate::handshake", "identity={} no longer signed in; nothing to undo", identity.id);
            return;
        }
        if let Err(e) = self.session.sign_out().await {
            warn!(target: "classgate::handshake", "provider sign_out failed, clearing locally: {}", e);
            self.session.clear_local("forced_sign_out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityProvider, MemoryProfileStore};

    struct Fixture {
        provider: Arc<MemoryIdentityProvider>,
        profiles: Arc<MemoryProfileStore>,
        resolver: Arc<RoleResolver>,
        session: Arc<SessionStore>,
        handshake: Arc<AuthHandshake>,
    }

    fn fixture() -> Fixture {
        let profiles = Arc::new(MemoryProfileStore::default());
        let provider = Arc::new(MemoryIdentityProvider::new(profiles.clone(), 6));
        let resolver = Arc::new(RoleResolver::new(profiles.clone()));
        let session = SessionStore::new(provider.clone(), resolver.clone());
        let handshake = Arc::new(AuthHandshake::new(provider.clone(), session.clone(), resolver.clone()));
        Fixture { provider, profiles, resolver, session, handshake }
    }

    fn fields(email: &str, password: &str) -> SignUpFields {
        SignUpFields {
            credentials: Credentials::new(email, password),
            full_name: "Ada Lovelace".into(),
            student_id: Some("S-42".into()),
        }
    }

    #[tokio::test]
    async fn sign_up_does_not_sign_in() {
        let f = fixture();
        let c = f.handshake.sign_up(fields("ada@school.test", "secret1"), Role::Student).await.expect("sign up");
        assert_eq!(c.role, Role::Student);
        assert!(!f.session.snapshot().is_authenticated());
        assert_eq!(f.handshake.state(), HandshakeState::Succeeded);
    }

    #[tokio::test]
    async fn sign_up_errors_are_classified() {
        let f = fixture();
        f.handshake.sign_up(fields("ada@school.test", "secret1"), Role::Student).await.expect("first");
        let dup = f.handshake.sign_up(fields("ada@school.test", "secret1"), Role::Student).await;
        assert_eq!(dup, Err(GateError::DuplicateRegistration));
        let weak = f.handshake.sign_up(fields("bob@school.test", "abc"), Role::Teacher).await;
        assert_eq!(weak, Err(GateError::WeakPassword { min_len: 6 }));
        assert_eq!(f.handshake.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let f = fixture();
        f.provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        let r = f.handshake.sign_in(Credentials::new("t@school.test", "nope"), None).await;
        assert_eq!(r, Err(GateError::InvalidCredentials));
        assert!(!f.session.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn unconfirmed_email_is_reported() {
        let f = fixture();
        f.provider.require_confirmation(true);
        f.handshake.sign_up(fields("new@school.test", "secret1"), Role::Student).await.expect("sign up");
        let r = f.handshake.sign_in(Credentials::new("new@school.test", "secret1"), None).await;
        assert_eq!(r, Err(GateError::EmailUnconfirmed));
        assert!(f.provider.confirm_email("new@school.test"));
        let out = f.handshake.sign_in(Credentials::new("new@school.test", "secret1"), Some(Role::Student)).await;
        assert_eq!(out.map(|o| o.role), Ok(Some(Role::Student)));
    }

    #[tokio::test]
    async fn mismatched_portal_signs_out() {
        let f = fixture();
        f.provider.seed_account("s@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        let r = f.handshake.sign_in(Credentials::new("s@school.test", "secret1"), Some(Role::Admin)).await;
        assert_eq!(r, Err(GateError::RoleMismatch { expected: Role::Admin }));
        assert!(f.session.snapshot().session.is_none());
    }

    #[tokio::test]
    async fn teacher_satisfies_admin_portal() {
        let f = fixture();
        f.provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        let out = f
            .handshake
            .sign_in(Credentials::new("t@school.test", "secret1"), Some(Role::Admin))
            .await
            .expect("sign in");
        assert_eq!(out.role, Some(Role::Teacher));
        assert!(f.session.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn unverifiable_role_signs_out() {
        let f = fixture();
        f.provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        f.profiles.fail_lookups("profiles offline");
        let r = f.handshake.sign_in(Credentials::new("t@school.test", "secret1"), Some(Role::Teacher)).await;
        assert!(matches!(r, Err(GateError::ProfileFetchFailed { .. })), "{:?}", r);
        assert!(!f.session.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn unknown_role_cannot_register() {
        let f = fixture();
        let r = f.handshake.sign_up(fields("who@school.test", "secret1"), Role::Unknown).await;
        assert_eq!(r, Err(GateError::UnsupportedRole { role: Role::Unknown }));
        assert_eq!(f.handshake.state(), HandshakeState::Failed);
        let r = f.handshake.sign_in(Credentials::new("who@school.test", "secret1"), None).await;
        assert_eq!(r, Err(GateError::InvalidCredentials));
    }

    #[tokio::test]
    async fn abandoned_portal_sign_in_still_signs_out_on_mismatch() {
        let f = fixture();
        let sam = f.provider.seed_account("sam@school.test", "secret1", "Sam", Role::Student, None).expect("seed");
        let hold = f.profiles.hold(&sam.id);
        let attempt = f.handshake.sign_in(Credentials::new("sam@school.test", "secret1"), Some(Role::Admin));
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), attempt).await;
        assert!(timed_out.is_err());
        assert_eq!(f.handshake.state(), HandshakeState::Idle);

        // The detached attempt binds the session, then waits on the held role lookup.
        let pending = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while f.resolver.resolution(&sam.id) != RoleResolution::Fetching {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(pending.is_ok());
        assert!(f.session.snapshot().is_authenticated());

        hold.release();
        let cleared = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while f.session.snapshot().is_authenticated() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(cleared.is_ok(), "student stayed signed in through the admin portal");
        assert_eq!(f.provider.current(), None);
    }

    #[tokio::test]
    async fn second_submit_is_busy() {
        let f = fixture();
        f.provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        let hold = f.provider.hold_sign_in();
        let h = f.handshake.clone();
        let first = tokio::spawn(async move { h.sign_in(Credentials::new("t@school.test", "secret1"), None).await });
        tokio::task::yield_now().await;
        assert_eq!(f.handshake.state(), HandshakeState::Submitting);
        let second = f.handshake.sign_in(Credentials::new("t@school.test", "secret1"), None).await;
        assert_eq!(second, Err(GateError::HandshakeBusy));
        hold.release();
        assert!(first.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn abandoned_attempt_returns_to_idle() {
        let f = fixture();
        f.provider.seed_account("t@school.test", "secret1", "Tess", Role::Teacher, None).expect("seed");
        let _hold = f.provider.hold_sign_in();
        let attempt = f.handshake.sign_in(Credentials::new("t@school.test", "secret1"), None);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), attempt).await;
        assert!(timed_out.is_err());
        assert_eq!(f.handshake.state(), HandshakeState::Idle);
    }
}
