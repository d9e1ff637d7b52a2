//! Unified gate error model and mapping helpers.
//! Every provider/store failure is classified into [`GateError`] before it leaves the
//! core. Each variant carries a stable message key the presentation layer renders
//! directly, a user-facing message, and an HTTP status for the sidecar.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Role;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not signed in")]
    Unauthenticated,
    #[error("email not confirmed")]
    EmailUnconfirmed,
    #[error("duplicate registration")]
    DuplicateRegistration,
    #[error("weak password (minimum {min_len} characters)")]
    WeakPassword { min_len: usize },
    #[error("cannot register with role {role}")]
    UnsupportedRole { role: Role },
    #[error("role mismatch: account is not registered as {expected}")]
    RoleMismatch { expected: Role },
    #[error("a sign-in or sign-up is already being submitted")]
    HandshakeBusy,
    #[error("profile fetch failed: {reason}")]
    ProfileFetchFailed { reason: String },
    #[error("operation already in progress for '{key}'")]
    OperationInProgress { key: String },
    #[error("resource '{id}' not found")]
    ResourceNotFound { id: String },
    /// Identity provider failure outside the classified cases.
    #[error("identity provider error: {message}")]
    Provider { message: String },
    /// Resource store failure outside the classified cases.
    #[error("resource store error: {message}")]
    Store { message: String },
}

/// Wire shape of an error as rendered to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl GateError {
    pub fn provider<S: Into<String>>(msg: S) -> Self { GateError::Provider { message: msg.into() } }
    pub fn store<S: Into<String>>(msg: S) -> Self { GateError::Store { message: msg.into() } }
    pub fn profile<S: Into<String>>(reason: S) -> Self { GateError::ProfileFetchFailed { reason: reason.into() } }

    /// Stable message key.
    pub fn code_str(&self) -> &'static str {
        match self {
            GateError::InvalidCredentials => "auth.invalid_credentials",
            GateError::Unauthenticated => "auth.required",
            GateError::EmailUnconfirmed => "auth.email_unconfirmed",
            GateError::DuplicateRegistration => "auth.duplicate_registration",
            GateError::WeakPassword { .. } => "auth.weak_password",
            GateError::UnsupportedRole { .. } => "auth.unsupported_role",
            GateError::RoleMismatch { .. } => "auth.role_mismatch",
            GateError::HandshakeBusy => "auth.handshake_busy",
            GateError::ProfileFetchFailed { .. } => "profile.fetch_failed",
            GateError::OperationInProgress { .. } => "operation.in_progress",
            GateError::ResourceNotFound { .. } => "resource.not_found",
            GateError::Provider { .. } => "auth.provider_error",
            GateError::Store { .. } => "resource.store_error",
        }
    }

    /// User-facing text for the message key.
    pub fn message(&self) -> String {
        match self {
            GateError::InvalidCredentials => "Invalid email or password. Please check your credentials and try again.".into(),
            GateError::Unauthenticated => "Please sign in to continue.".into(),
            GateError::EmailUnconfirmed => "Please check your email and click the confirmation link before signing in.".into(),
            GateError::DuplicateRegistration => "An account with this email already exists. Please sign in instead.".into(),
            GateError::WeakPassword { min_len } => format!("Password must be at least {} characters long.", min_len),
            GateError::UnsupportedRole { .. } => "Please register as a student, teacher or admin.".into(),
            GateError::RoleMismatch { expected } => format!(
                "This account is not registered as a {}. Please use the correct login portal.",
                expected
            ),
            GateError::HandshakeBusy => "A request is already being processed. Please wait.".into(),
            GateError::ProfileFetchFailed { .. } => "Unable to verify user role. Please try again.".into(),
            GateError::OperationInProgress { .. } => "This action is already in progress.".into(),
            GateError::ResourceNotFound { .. } => "The requested item no longer exists.".into(),
            GateError::Provider { message } | GateError::Store { message } => message.clone(),
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            GateError::InvalidCredentials | GateError::EmailUnconfirmed | GateError::Unauthenticated => 401,
            GateError::RoleMismatch { .. } => 403,
            GateError::DuplicateRegistration => 409,
            GateError::WeakPassword { .. } | GateError::UnsupportedRole { .. } => 400,
            GateError::HandshakeBusy | GateError::OperationInProgress { .. } => 409,
            GateError::ResourceNotFound { .. } => 404,
            GateError::ProfileFetchFailed { .. } | GateError::Provider { .. } | GateError::Store { .. } => 502,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody { code: self.code_str().to_string(), message: self.message() }
    }
}

pub type GateResult<T> = Result<T, GateError>;
