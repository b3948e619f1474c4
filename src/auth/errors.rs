use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::Permission;

/// Why a role does not currently grant access
///
/// Denials are not retryable without a change to the role itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The role has been switched off
    Inactive,
    /// The role's expiry timestamp has passed
    Expired,
    /// The role restricts callers by IP and this caller matched no entry
    IpRestricted,
}

impl DenyReason {
    /// Stable machine-readable code, used in responses, logs and metric labels
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Inactive => "ROLE_INACTIVE",
            DenyReason::Expired => "ROLE_EXPIRED",
            DenyReason::IpRestricted => "IP_RESTRICTED",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::Inactive => "role is inactive",
            DenyReason::Expired => "role has expired",
            DenyReason::IpRestricted => "caller IP is not in the role's allowlist",
        };
        write!(f, "{}", s)
    }
}

/// Rejected role writes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed allowed IP entry {entry:?}: {reason}")]
    MalformedIpEntry { entry: String, reason: String },

    #[error("user id must not be empty")]
    EmptyUserId,
}

/// Failures reported by a role store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("role for user {0} already exists")]
    AlreadyExists(String),

    #[error("role for user {0} not found")]
    NotFound(String),

    #[error("role store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Outcome of an authorization attempt that did not grant access
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("access denied: {0}")]
    Denied(DenyReason),

    #[error("no role assigned to user {0}")]
    RoleNotFound(String),

    #[error("role does not grant {0}")]
    MissingPermission(Permission),

    #[error("role store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AuthorizationError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthorizationError::Denied(reason) => reason.code(),
            AuthorizationError::RoleNotFound(_) => "NO_ROLE",
            AuthorizationError::MissingPermission(_) => "PERMISSION_DENIED",
            AuthorizationError::StoreUnavailable(_) => "AUTHZ_UNAVAILABLE",
        }
    }
}
