//! Identity of the signed-in user.
//!
//! Credentials and sessions are managed by the backend; the core only reads
//! who the current user is and which role they hold.

use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What a user is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Conductor,
    #[default]
    Passenger,
    Admin,
}

impl UserRole {
    /// Whether this role may run trips and broadcast bus positions.
    pub fn can_broadcast(&self) -> bool {
        matches!(self, UserRole::Conductor | UserRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Conductor => "conductor",
            UserRole::Passenger => "passenger",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conductor" => Ok(UserRole::Conductor),
            "passenger" => Ok(UserRole::Passenger),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: UserRole,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            full_name: None,
            role,
        }
    }
}

/// Read-only view of the auth session.
pub trait AuthProvider: Send + Sync {
    /// The current user, or `None` when signed out.
    fn current_identity(&self) -> Option<Identity>;
}

/// Auth provider holding a fixed identity that can be swapped out.
#[derive(Debug, Default)]
pub struct StaticAuth {
    identity: RwLock<Option<Identity>>,
}

impl StaticAuth {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_out(&self) {
        *self.identity.write() = None;
    }
}

impl AuthProvider for StaticAuth {
    fn current_identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }
}
