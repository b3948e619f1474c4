//! Role validity evaluation
//!
//! Checks run in a fixed order and the first failing check decides:
//!
//! 1. inactive role → `Denied(Inactive)`
//! 2. `expires_at` reached → `Denied(Expired)`
//! 3. non-empty allowlist with no matching entry → `Denied(IpRestricted)`
//! 4. otherwise `Authorized` with the role's permissions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::{DenyReason, PermissionSet, RoleRecord};

/// Result of evaluating a role at a point in time for one caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    Authorized(PermissionSet),
    Denied(DenyReason),
}

impl Decision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::Authorized(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Authorized(_) => "authorized",
            Decision::Denied(_) => "denied",
        }
    }
}

/// Stateless evaluator; cheap enough to run on every request
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidityEvaluator;

impl ValidityEvaluator {
    pub fn evaluate(role: &RoleRecord, now: DateTime<Utc>, caller_ip: IpAddr) -> Decision {
        if !role.is_active() {
            return Decision::Denied(DenyReason::Inactive);
        }

        if let Some(expires_at) = role.expires_at() {
            if now >= expires_at {
                return Decision::Denied(DenyReason::Expired);
            }
        }

        if role.is_ip_restricted() && !role.allowed_ips().iter().any(|rule| rule.matches(&caller_ip)) {
            return Decision::Denied(DenyReason::IpRestricted);
        }

        Decision::Authorized(role.permissions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Permission, RoleDraft};
    use chrono::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_inactive_wins_over_everything() {
        let now = Utc::now();
        let role = RoleDraft::new("alice")
            .active(false)
            .expires_at(now - Duration::days(1))
            .allow_ip("10.0.0.0/8")
            .validate()
            .unwrap();

        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("192.168.0.1")),
            Decision::Denied(DenyReason::Inactive)
        );
        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("10.1.2.3")),
            Decision::Denied(DenyReason::Inactive)
        );
    }

    #[test]
    fn test_expired_yesterday() {
        let now = Utc::now();
        let role = RoleDraft::new("alice")
            .expires_at(now - Duration::days(1))
            .validate()
            .unwrap();

        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("10.0.0.1")),
            Decision::Denied(DenyReason::Expired)
        );
    }

    #[test]
    fn test_expiry_is_inclusive_of_now() {
        let now = Utc::now();
        let role = RoleDraft::new("alice").expires_at(now).validate().unwrap();

        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("10.0.0.1")),
            Decision::Denied(DenyReason::Expired)
        );
        assert!(ValidityEvaluator::evaluate(&role, now - Duration::seconds(1), ip("10.0.0.1")).is_authorized());
    }

    #[test]
    fn test_expired_checked_before_ip() {
        let now = Utc::now();
        let role = RoleDraft::new("alice")
            .expires_at(now - Duration::minutes(1))
            .allow_ip("192.168.1.0/24")
            .validate()
            .unwrap();

        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("10.0.0.1")),
            Decision::Denied(DenyReason::Expired)
        );
    }

    #[test]
    fn test_ip_restricted_role() {
        let permissions = PermissionSet::default().with(Permission::ViewImages);
        let role = RoleDraft::new("alice")
            .permissions(permissions)
            .allow_ip("192.168.1.0/24")
            .validate()
            .unwrap();
        let now = Utc::now();

        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("192.168.1.50")),
            Decision::Authorized(permissions)
        );
        assert_eq!(
            ValidityEvaluator::evaluate(&role, now, ip("10.0.0.1")),
            Decision::Denied(DenyReason::IpRestricted)
        );
    }

    #[test]
    fn test_unrestricted_role_authorizes_any_ip() {
        let role = RoleDraft::new("alice")
            .permissions(PermissionSet::all())
            .expires_at(Utc::now() + Duration::days(30))
            .validate()
            .unwrap();

        for caller in ["10.0.0.1", "2001:db8::5", "127.0.0.1"] {
            assert_eq!(
                ValidityEvaluator::evaluate(&role, Utc::now(), ip(caller)),
                Decision::Authorized(PermissionSet::all())
            );
        }
    }

    #[test]
    fn test_any_matching_entry_authorizes() {
        let role = RoleDraft::new("alice")
            .allow_ip("203.0.113.7")
            .allow_ip("10.0.0.0/24")
            .validate()
            .unwrap();

        assert!(ValidityEvaluator::evaluate(&role, Utc::now(), ip("203.0.113.7")).is_authorized());
        assert!(ValidityEvaluator::evaluate(&role, Utc::now(), ip("10.0.0.200")).is_authorized());
        assert!(!ValidityEvaluator::evaluate(&role, Utc::now(), ip("10.0.1.1")).is_authorized());
    }
}
