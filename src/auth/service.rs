//! Authorization flow: cache, then role store, then evaluation
//!
//! ```text
//! get(user, ip) ── Hit ──────────────────────────────► decision
//!       │
//!      Miss ─► ticket ─► breaker(store.get) ─► evaluate ─► set_if_current
//! ```
//!
//! No cache lock is held while the store is queried. Store failures and
//! open breakers deny; they are never turned into an allow.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    AuthorizationError, CachedAccess, CacheLookup, CallerIdentity, CircuitBreaker, CircuitBreakerConfig,
    Decision, DecisionSource, Permission, PermissionCache, PermissionSet, RoleRecord, RoleStore,
    ValidityEvaluator, audit_authorization_decision,
};
use crate::clock::Clock;
use crate::observability::metrics::record_authorization_decision;

pub struct AuthorizationService {
    cache: Arc<dyn PermissionCache>,
    store: Arc<dyn RoleStore>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl AuthorizationService {
    pub fn new(
        cache: Arc<dyn PermissionCache>,
        store: Arc<dyn RoleStore>,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            store,
            breaker: CircuitBreaker::new("role_store", breaker_config),
            clock,
        }
    }

    /// Resolve the caller's current permissions
    ///
    /// Returns the specific denial reason when the role does not grant
    /// access right now.
    pub async fn authorize(&self, caller: &CallerIdentity) -> Result<PermissionSet, AuthorizationError> {
        let start = Instant::now();

        let resolved = match self.cache.get(&caller.user_id, caller.caller_ip).await {
            CacheLookup::Hit(access) => Ok((access.decision, DecisionSource::Cache)),
            CacheLookup::Miss => self.resolve(caller).await.map(|d| (d, DecisionSource::Store)),
        };

        let (result, source) = match resolved {
            Ok((Decision::Authorized(permissions), source)) => (Ok(permissions), source),
            Ok((Decision::Denied(reason), source)) => (Err(AuthorizationError::Denied(reason)), source),
            Err(e) => (Err(e), DecisionSource::Store),
        };

        let reason = result.as_ref().err().map(AuthorizationError::code);
        record_authorization_decision(reason.is_none(), source.as_str());
        audit_authorization_decision(caller, reason, source, start.elapsed());

        result
    }

    /// Like [`authorize`](Self::authorize), and additionally require one permission
    pub async fn require(
        &self,
        caller: &CallerIdentity,
        permission: Permission,
    ) -> Result<PermissionSet, AuthorizationError> {
        let permissions = self.authorize(caller).await?;
        if permissions.allows(permission) {
            Ok(permissions)
        } else {
            debug!(user_id = %caller.user_id, %permission, "Permission not granted by role");
            Err(AuthorizationError::MissingPermission(permission))
        }
    }

    pub fn cache(&self) -> &Arc<dyn PermissionCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn resolve(&self, caller: &CallerIdentity) -> Result<Decision, AuthorizationError> {
        // Taken before the read so that a mutation landing during the read
        // voids the fill.
        let ticket = self.cache.fill_ticket().await;
        let role = self.fetch_role(&caller.user_id).await?;

        let now = self.clock.now();
        let decision = ValidityEvaluator::evaluate(&role, now, caller.caller_ip);

        let access = CachedAccess {
            decision,
            ip_restricted: role.is_ip_restricted(),
        };
        let ttl = self.ttl_for(&role, now);
        if !ttl.is_zero() {
            self.cache
                .set_if_current(ticket, &caller.user_id, caller.caller_ip, access, ttl)
                .await;
        }

        Ok(decision)
    }

    async fn fetch_role(&self, user_id: &str) -> Result<RoleRecord, AuthorizationError> {
        let store = Arc::clone(&self.store);
        let lookup = self.breaker.call(|| async move { store.get(user_id).await }).await;

        match lookup {
            Ok(Some(role)) => Ok(role),
            Ok(None) => Err(AuthorizationError::RoleNotFound(user_id.to_string())),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Role lookup failed, denying");
                Err(AuthorizationError::StoreUnavailable(e.to_string()))
            }
        }
    }

    /// No cached decision outlives the role's expiry; past it the answer
    /// becomes `Expired`, which takes precedence over an IP denial
    fn ttl_for(&self, role: &RoleRecord, now: chrono::DateTime<chrono::Utc>) -> Duration {
        let ttl = self.cache.default_ttl();
        match role.expires_at() {
            Some(expires_at) if expires_at > now => (expires_at - now)
                .to_std()
                .map(|remaining| remaining.min(ttl))
                .unwrap_or(Duration::ZERO),
            _ => ttl,
        }
    }
}
