//! Narrow contracts of the external collaborators: identity provider and profile store.
//! Both are object safe and return boxed futures so the core can hold them as
//! `Arc<dyn ...>` and stay agnostic of the concrete transport.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use thiserror::Error;

use super::principal::{Identity, ProfileMetadata, Role};
use crate::error::GateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInError {
    InvalidCredentials,
    EmailUnconfirmed,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpError {
    DuplicateRegistration,
    WeakPassword { min_len: usize },
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl SignInError {
    /// Classify a raw provider message. Providers that only surface text are
    /// matched on their documented phrases; anything else stays `Other`.
    pub fn from_message(msg: &str) -> Self {
        if msg.contains("Invalid login credentials") {
            SignInError::InvalidCredentials
        } else if msg.contains("Email not confirmed") {
            SignInError::EmailUnconfirmed
        } else {
            SignInError::Other(msg.to_string())
        }
    }
}

impl SignUpError {
    pub fn from_message(msg: &str) -> Self {
        if msg.contains("User already registered") {
            SignUpError::DuplicateRegistration
        } else if let Some(rest) = msg.split("Password should be at least").nth(1) {
            let min_len = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(6);
            SignUpError::WeakPassword { min_len }
        } else {
            SignUpError::Other(msg.to_string())
        }
    }
}

impl From<SignInError> for GateError {
    fn from(e: SignInError) -> Self {
        match e {
            SignInError::InvalidCredentials => GateError::InvalidCredentials,
            SignInError::EmailUnconfirmed => GateError::EmailUnconfirmed,
            SignInError::Other(m) => GateError::provider(m),
        }
    }
}

impl From<SignUpError> for GateError {
    fn from(e: SignUpError) -> Self {
        match e {
            SignUpError::DuplicateRegistration => GateError::DuplicateRegistration,
            SignUpError::WeakPassword { min_len } => GateError::WeakPassword { min_len },
            SignUpError::Other(m) => GateError::provider(m),
        }
    }
}

impl From<ProviderError> for GateError {
    fn from(e: ProviderError) -> Self { GateError::provider(e.0) }
}

/// One item per auth change: the identity now current, or `None` when signed out
/// or expired. The first item reflects the state at subscription time.
pub type AuthEvent = Result<Option<Identity>, ProviderError>;

pub trait IdentityProvider: Send + Sync {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<Identity, SignInError>>;
    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: ProfileMetadata,
    ) -> BoxFuture<'a, Result<Identity, SignUpError>>;
    fn sign_out(&self) -> BoxFuture<'_, Result<(), ProviderError>>;
    fn events(&self) -> BoxStream<'static, AuthEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    NotFound,
    Other(String),
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileError::NotFound => f.write_str("profile not found"),
            ProfileError::Other(m) => f.write_str(m),
        }
    }
}

impl From<ProfileError> for GateError {
    fn from(e: ProfileError) -> Self { GateError::profile(e.to_string()) }
}

pub trait ProfileStore: Send + Sync {
    fn get_role<'a>(&'a self, identity_id: &'a str) -> BoxFuture<'a, Result<Role, ProfileError>>;
}
