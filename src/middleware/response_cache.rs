use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::pipeline::{DedupStats, RequestDeduplicator, ResponseCache, ResponseLookup, RouteClass, RouteKey};

pub const X_CACHE: &str = "x-cache";

/// Response body and the headers needed to replay it
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

enum Collected {
    Buffered(CachedResponse),
    /// Body larger than the limit, or of unknown length; left untouched
    Oversized(Response),
}

impl CachedResponse {
    async fn collect(response: Response, max_body_bytes: usize) -> Result<Collected, String> {
        let fits = response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|upper| upper <= max_body_bytes as u64);
        if !fits {
            return Ok(Collected::Oversized(response));
        }

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;
        Ok(Collected::Buffered(Self {
            status: parts.status,
            content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
            body,
        }))
    }

    fn replay(self, cache_status: &'static str, age: Option<Duration>) -> Response {
        let mut response = (self.status, Body::from(self.body)).into_response();
        let headers = response.headers_mut();
        if let Some(content_type) = self.content_type {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        headers.insert(X_CACHE, HeaderValue::from_static(cache_status));
        if let Some(age) = age {
            headers.insert(header::AGE, HeaderValue::from(age.as_secs()));
        }
        response
    }
}

/// Result of one upstream read as seen by every request that waited on it
#[derive(Clone)]
enum ReadOutcome {
    Buffered(CachedResponse),
    /// Unbuffered response, owned by the request that produced it
    Unbuffered(Arc<Mutex<Option<Response>>>),
}

/// Response cache plus single-flight for reads
pub struct ResponsePipeline {
    cache: Arc<ResponseCache<CachedResponse>>,
    dedup: RequestDeduplicator<RouteKey, ReadOutcome, String>,
}

impl ResponsePipeline {
    pub fn new(cache: Arc<ResponseCache<CachedResponse>>) -> Self {
        Self {
            cache,
            dedup: RequestDeduplicator::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache<CachedResponse>> {
        &self.cache
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Routes without a rule fall in the default class and are scoped to
    /// the caller.
    fn key_for(&self, req: &Request) -> (RouteKey, Duration) {
        let config = self.cache.config();
        let path = req.uri().path();
        let (class, caller_scoped) = config
            .rule_for(path)
            .map(|rule| (rule.class, rule.caller_scoped))
            .unwrap_or((RouteClass::Default, true));

        let mut key = RouteKey::new(req.method().as_str(), path, req.uri().query());
        if caller_scoped {
            if let Some(caller) = req.extensions().get::<CallerIdentity>() {
                key = key.scoped_to(caller.user_id.as_str());
            }
        }
        (key, config.ttl_for(class))
    }
}

/// Serve GETs from the response cache, collapsing concurrent misses into
/// one call of the inner service. Successful writes purge the cached reads
/// under their path.
pub async fn response_cache_middleware(
    State(pipeline): State<Arc<ResponsePipeline>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    match *req.method() {
        Method::GET => serve_read(pipeline, req, next).await,
        Method::HEAD | Method::OPTIONS => Ok(next.run(req).await),
        _ => {
            let path = req.uri().path().to_string();
            let response = next.run(req).await;
            if response.status().is_success() {
                pipeline.cache.purge_route(&path).await;
            }
            Ok(response)
        }
    }
}

async fn serve_read(pipeline: Arc<ResponsePipeline>, req: Request, next: Next) -> Result<Response, AppError> {
    let (key, ttl) = pipeline.key_for(&req);

    if let ResponseLookup::Hit { payload, age } = pipeline.cache.get(&key).await {
        return Ok(payload.replay("HIT", Some(age)));
    }

    // The request stays reclaimable so that a follower can run it itself
    // when the leader's response cannot be shared.
    let own = Arc::new(Mutex::new(Some((req, next))));
    let leader_request = Arc::clone(&own);
    let cache = Arc::clone(&pipeline.cache);
    let max_body_bytes = cache.config().max_body_bytes;
    let fill_key = key.clone();

    let outcome = pipeline
        .dedup
        .dedupe(key, move || async move {
            let pending = leader_request.lock().take();
            let Some((req, next)) = pending else {
                return Err("read request already consumed".to_string());
            };

            let ticket = cache.fill_ticket().await;
            match CachedResponse::collect(next.run(req).await, max_body_bytes).await? {
                Collected::Buffered(response) => {
                    if response.status.is_success() {
                        cache.set_if_current(ticket, fill_key, response.clone(), ttl).await;
                    }
                    Ok(ReadOutcome::Buffered(response))
                }
                Collected::Oversized(response) => Ok(ReadOutcome::Unbuffered(Arc::new(Mutex::new(Some(response))))),
            }
        })
        .await?;

    match outcome {
        ReadOutcome::Buffered(response) => Ok(response.replay("MISS", None)),
        ReadOutcome::Unbuffered(produced) => {
            let pending = own.lock().take();
            let response = match pending {
                Some((req, next)) => next.run(req).await,
                None => {
                    let produced = produced.lock().take();
                    produced.ok_or_else(|| AppError::Upstream("read response already taken".to_string()))?
                }
            };
            Ok(bypass(response))
        }
    }
}

fn bypass(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("BYPASS"));
    response
}
