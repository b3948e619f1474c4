//! Wiring of the gatekeeper's parts from configuration

use axum::{Router, middleware::from_fn, middleware::from_fn_with_state};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::admission::{AdmissionController, AdmissionQueue, AdmissionQueueConfig, ControllerStats, NoopRateLimiter, RateLimiter};
use crate::auth::{
    AuthorizationService, CacheConfig, CacheStats, CircuitBreakerConfig, InMemoryPermissionCache, InMemoryRoleStore,
    InvalidatingRoleStore, InvalidationChain, NoopPermissionCache, PermissionCache, PermissionCacheInvalidator,
    RoleStore,
};
use crate::auth::circuit_breaker::CircuitBreakerStats;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::middleware::{
    AuthorizationState, ResponsePipeline, admission_middleware, authorization_middleware, metrics_middleware,
    response_cache_middleware,
};
use crate::pipeline::{DedupStats, ResponseCache, ResponseCacheConfig, ResponseCacheInvalidator, ResponseCacheStats};
use crate::tasks::BackgroundTask;

/// Everything a protected router needs, built once per process
pub struct Gatekeeper {
    permission_cache: Arc<dyn PermissionCache>,
    sweepable_cache: Option<Arc<InMemoryPermissionCache>>,
    role_store: Arc<InvalidatingRoleStore<Arc<dyn RoleStore>>>,
    authorization: Arc<AuthorizationService>,
    admission: Arc<AdmissionController>,
    responses: Option<Arc<ResponsePipeline>>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatekeeperStats {
    pub permission_cache: CacheStats,
    pub role_store_breaker: CircuitBreakerStats,
    pub admission: ControllerStats,
    pub dedup: Option<DedupStats>,
    pub response_cache: Option<ResponseCacheStats>,
}

impl Gatekeeper {
    /// In-memory role store, no external rate limiter, wall clock
    pub fn new(config: &AppConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(InMemoryRoleStore::new()),
            Arc::new(NoopRateLimiter),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: &AppConfig,
        store: Arc<dyn RoleStore>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sweepable_cache = config.permission_cache.enabled.then(|| {
            Arc::new(InMemoryPermissionCache::new(
                CacheConfig::from(&config.permission_cache),
                Arc::clone(&clock),
            ))
        });
        let permission_cache: Arc<dyn PermissionCache> = match &sweepable_cache {
            Some(cache) => cache.clone(),
            None => {
                info!("Permission cache disabled, every request reads the role store");
                Arc::new(NoopPermissionCache::new())
            }
        };

        let responses = config.response_cache.enabled.then(|| {
            let cache = ResponseCache::new(ResponseCacheConfig::from(&config.response_cache), Arc::clone(&clock));
            Arc::new(ResponsePipeline::new(Arc::new(cache)))
        });

        let mut hooks = InvalidationChain::new().with(Arc::new(PermissionCacheInvalidator::new(Arc::clone(
            &permission_cache,
        ))));
        if let Some(responses) = &responses {
            hooks = hooks.with(Arc::new(ResponseCacheInvalidator::new(Arc::clone(responses.cache()))));
        }
        let role_store = Arc::new(InvalidatingRoleStore::new(store, Arc::new(hooks)));

        let authorization = Arc::new(AuthorizationService::new(
            Arc::clone(&permission_cache),
            role_store.clone(),
            CircuitBreakerConfig::from(&config.role_store_breaker),
            Arc::clone(&clock),
        ));

        let queue = Arc::new(AdmissionQueue::new(AdmissionQueueConfig::from(&config.admission)));
        let admission = Arc::new(AdmissionController::new(limiter, queue));

        Self {
            permission_cache,
            sweepable_cache,
            role_store,
            authorization,
            admission,
            responses,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Role store whose mutations invalidate cached permissions
    pub fn role_store(&self) -> &Arc<InvalidatingRoleStore<Arc<dyn RoleStore>>> {
        &self.role_store
    }

    pub fn authorization(&self) -> &Arc<AuthorizationService> {
        &self.authorization
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn responses(&self) -> Option<&Arc<ResponsePipeline>> {
        self.responses.as_ref()
    }

    /// Wrap `router` with metrics, admission, authorization and the read
    /// pipeline, outermost first
    pub fn protect<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        if let Some(responses) = &self.responses {
            router = router.layer(from_fn_with_state(Arc::clone(responses), response_cache_middleware));
        }
        router
            .layer(from_fn_with_state(
                AuthorizationState::new(Arc::clone(&self.authorization)),
                authorization_middleware,
            ))
            .layer(from_fn_with_state(Arc::clone(&self.admission), admission_middleware))
            .layer(from_fn(metrics_middleware))
    }

    /// Start cache sweepers and the admission scheduler
    ///
    /// Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        if let Some(cache) = &self.sweepable_cache {
            tasks.push(cache.start_sweeper());
        }
        if let Some(responses) = &self.responses {
            tasks.push(responses.cache().start_sweeper());
        }
        tasks.push(self.admission.start_scheduler());

        info!(tasks = tasks.len(), "Gatekeeper background tasks started");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(BackgroundTask::is_running)
    }

    /// Fail queued requests and stop every background task
    pub async fn shutdown(&self) {
        self.admission.queue().close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
        info!("Gatekeeper shut down");
    }

    pub async fn stats(&self) -> GatekeeperStats {
        let (dedup, response_cache) = match &self.responses {
            Some(responses) => (Some(responses.dedup_stats()), Some(responses.cache().stats().await)),
            None => (None, None),
        };

        GatekeeperStats {
            permission_cache: self.permission_cache.stats().await,
            role_store_breaker: self.authorization.breaker().stats().await,
            admission: self.admission.stats(),
            dedup,
            response_cache,
        }
    }
}
