use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{AuthorizationService, CallerIdentity, Permission};
use crate::error::AppError;

#[derive(Clone)]
pub struct AuthorizationState {
    service: Arc<AuthorizationService>,
    required: Option<Permission>,
}

impl AuthorizationState {
    pub fn new(service: Arc<AuthorizationService>) -> Self {
        Self {
            service,
            required: None,
        }
    }

    /// Reject callers whose role lacks `permission`
    pub fn requiring(mut self, permission: Permission) -> Self {
        self.required = Some(permission);
        self
    }
}

/// Resolve the caller's permissions and attach them as a request extension
///
/// Handlers read the result with `Extension<PermissionSet>`. Denials carry
/// their specific reason code.
pub async fn authorization_middleware(
    State(state): State<AuthorizationState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = req
        .extensions()
        .get::<CallerIdentity>()
        .cloned()
        .ok_or(AppError::Unauthenticated)?;

    let permissions = match state.required {
        Some(permission) => state.service.require(&caller, permission).await?,
        None => state.service.authorize(&caller).await?,
    };

    req.extensions_mut().insert(permissions);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        CacheConfig, CircuitBreakerConfig, InMemoryPermissionCache, InMemoryRoleStore, PermissionSet,
        RoleDraft, RoleStore,
    };
    use crate::clock::SystemClock;
    use axum::{
        Extension, Router,
        body::Body,
        http::{Request, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    async fn service() -> Arc<AuthorizationService> {
        let store = Arc::new(InMemoryRoleStore::new());
        store
            .create(RoleDraft::new("viewer").permissions(PermissionSet::default().with(Permission::ViewImages)))
            .await
            .unwrap();
        store
            .create(RoleDraft::new("office").allow_ip("10.1.0.0/16").permissions(PermissionSet::all()))
            .await
            .unwrap();
        store
            .create(RoleDraft::new("disabled").active(false))
            .await
            .unwrap();

        let clock = Arc::new(SystemClock);
        Arc::new(AuthorizationService::new(
            Arc::new(InMemoryPermissionCache::new(CacheConfig::default(), clock.clone())),
            store,
            CircuitBreakerConfig::default(),
            clock,
        ))
    }

    async fn handler(Extension(permissions): Extension<PermissionSet>) -> String {
        permissions.granted().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
    }

    async fn call(state: AuthorizationState, caller: Option<CallerIdentity>) -> (StatusCode, String) {
        let mut app = Router::new()
            .route("/images", get(handler))
            .layer(from_fn_with_state(state, authorization_middleware));
        if let Some(caller) = caller {
            app = app.layer(Extension(caller));
        }

        let response = app
            .oneshot(Request::builder().uri("/images").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_permissions_attached_for_handler() {
        let state = AuthorizationState::new(service().await);
        let caller = CallerIdentity::new("viewer", "192.168.1.1".parse().unwrap());

        let (status, body) = call(state, Some(caller)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Permission::ViewImages.to_string());
    }

    #[tokio::test]
    async fn test_denials_are_forbidden_with_reason() {
        let service = service().await;

        let outside = CallerIdentity::new("office", "172.16.0.1".parse().unwrap());
        let (status, body) = call(AuthorizationState::new(service.clone()), Some(outside)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("IP_RESTRICTED"));

        let disabled = CallerIdentity::new("disabled", "10.1.2.3".parse().unwrap());
        let (status, body) = call(AuthorizationState::new(service.clone()), Some(disabled)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("ROLE_INACTIVE"));

        let unknown = CallerIdentity::new("nobody", "10.1.2.3".parse().unwrap());
        let (status, body) = call(AuthorizationState::new(service), Some(unknown)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("NO_ROLE"));
    }

    #[tokio::test]
    async fn test_required_permission_enforced() {
        let service = service().await;
        let caller = CallerIdentity::new("viewer", "192.168.1.1".parse().unwrap());

        let state = AuthorizationState::new(service.clone()).requiring(Permission::ManageRoles);
        let (status, body) = call(state, Some(caller.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("PERMISSION_DENIED"));

        let state = AuthorizationState::new(service).requiring(Permission::ViewImages);
        let (status, _) = call(state, Some(caller)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let (status, _) = call(AuthorizationState::new(service().await), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
