//! Caller identity, role, and session types
//!
//! Roles are resolved once per session and handed explicitly to the role
//! gate. Anything short of a positively resolved `admin` role is `employee`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Display name used when neither the profile nor the identity offers one.
pub const DEFAULT_DISPLAY_NAME: &str = "User";

/// Caller role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Employee,
}

impl Role {
    /// Interpret a role value read from a profile record.
    ///
    /// Only the exact value `admin` grants the admin role; unknown, empty, or
    /// absent values fall back to `employee`.
    pub fn from_profile_value(value: Option<&str>) -> Self {
        match value {
            Some("admin") => Role::Admin,
            _ => Role::Employee,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Role::Admin => Capabilities {
                view_document_ids: true,
                manage_records: true,
            },
            Role::Employee => Capabilities::default(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
        }
    }
}

/// What a role is allowed to see and do in the presentation layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Backend document identifiers of snapshots.
    pub view_document_ids: bool,
    /// Record management affordances on history entries.
    pub manage_records: bool,
}

/// Opaque identity handed out by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: UserId,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<UserId>, email: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            email,
        }
    }
}

/// Profile record stored under the user's uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Resolved caller session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: Option<UserId>,
    pub display_name: String,
    pub role: Role,
    pub resolved_at: DateTime<Utc>,
}

impl Session {
    /// Session for an absent identity.
    pub fn anonymous() -> Self {
        Self {
            uid: None,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            role: Role::Employee,
            resolved_at: Utc::now(),
        }
    }

    /// Fail-closed session for an identity whose profile could not be read.
    pub fn fallback(identity: &Identity) -> Self {
        Self {
            uid: Some(identity.uid.clone()),
            display_name: display_name_for(identity, None),
            role: Role::Employee,
            resolved_at: Utc::now(),
        }
    }

    pub fn from_profile(identity: &Identity, profile: &Profile) -> Self {
        Self {
            uid: Some(identity.uid.clone()),
            display_name: display_name_for(identity, Some(profile)),
            role: Role::from_profile_value(profile.role.as_deref()),
            resolved_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn capabilities(&self) -> Capabilities {
        self.role.capabilities()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Profile display name, else the local part of the profile or identity
/// email, else [`DEFAULT_DISPLAY_NAME`].
fn display_name_for(identity: &Identity, profile: Option<&Profile>) -> String {
    if let Some(name) = profile
        .and_then(|p| p.display_name.as_deref())
        .filter(|n| !n.trim().is_empty())
    {
        return name.to_string();
    }

    profile
        .and_then(|p| p.email.as_deref())
        .or(identity.email.as_deref())
        .and_then(|email| email.split('@').next())
        .filter(|local| !local.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME)
        .to_string()
}
