use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated principal supplied by the identity provider. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

/// The current binding between this process and an [`Identity`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity) -> Self { Self { identity, established_at: Utc::now() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Admin,
    /// Profile carried a role string this core does not know.
    Unknown,
}

impl Role {
    /// Lenient parse used on profile data; unrecognised strings map to `Unknown`.
    pub fn parse(s: &str) -> Role {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Role::Student,
            "teacher" => Role::Teacher,
            "admin" | "administrator" => Role::Admin,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
            Role::Unknown => "unknown",
        }
    }

    pub fn is_staff(&self) -> bool { matches!(self, Role::Teacher | Role::Admin) }

    /// Portal contract used by role-specific sign-in entry points. Teacher and admin
    /// share the staff portal, so either satisfies the other.
    pub fn satisfies(&self, expected: Role) -> bool {
        match expected {
            Role::Student => *self == Role::Student,
            Role::Teacher | Role::Admin => self.is_staff(),
            Role::Unknown => false,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Profile row attached to an identity at sign-up. One per identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub identity_id: String,
    pub role: Role,
    pub full_name: String,
    #[serde(default)]
    pub student_id: Option<String>,
}

/// Metadata embedded in the provider's sign-up call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileMetadata {
    pub full_name: String,
    pub role: Role,
    #[serde(default)]
    pub student_id: Option<String>,
}

impl ProfileMetadata {
    /// Student ids are only recorded for student accounts; blanks are dropped.
    pub fn new(full_name: impl Into<String>, role: Role, student_id: Option<String>) -> Self {
        let student_id = match role {
            Role::Student => student_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            _ => None,
        };
        Self { full_name: full_name.into(), role, student_id }
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self { email: email.into(), password: password.into() }
    }
}

// Keep passwords out of logs and debug dumps
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("email", &self.email).field("password", &"<redacted>").finish()
    }
}

/// Sign-up form fields; the role travels separately as the handshake's role hint.
#[derive(Debug, Clone, Deserialize)]
pub struct SignUpFields {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub full_name: String,
    #[serde(default)]
    pub student_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_is_lenient() {
        assert_eq!(Role::parse("Student"), Role::Student);
        assert_eq!(Role::parse(" teacher "), Role::Teacher);
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("parent"), Role::Unknown);
        assert_eq!(Role::parse(""), Role::Unknown);
    }

    #[test]
    fn staff_roles_share_portal() {
        assert!(Role::Teacher.satisfies(Role::Admin));
        assert!(Role::Admin.satisfies(Role::Teacher));
        assert!(!Role::Student.satisfies(Role::Admin));
        assert!(!Role::Admin.satisfies(Role::Student));
        assert!(!Role::Unknown.satisfies(Role::Student));
    }

    #[test]
    fn student_id_only_kept_for_students() {
        let m = ProfileMetadata::new("Ada", Role::Teacher, Some("S-1".into()));
        assert_eq!(m.student_id, None);
        let m = ProfileMetadata::new("Ada", Role::Student, Some("  ".into()));
        assert_eq!(m.student_id, None);
        let m = ProfileMetadata::new("Ada", Role::Student, Some("S-1".into()));
        assert_eq!(m.student_id.as_deref(), Some("S-1"));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let c = Credentials::new("a@b.com", "hunter22");
        assert!(!format!("{:?}", c).contains("hunter22"));
    }
}
