//! HTTP layers
//!
//! Applied outermost first by [`Gatekeeper::protect`](crate::components::Gatekeeper::protect):
//!
//! 1. request metrics
//! 2. admission control, keyed by the caller's client id
//! 3. authorization, which attaches the caller's [`PermissionSet`](crate::auth::PermissionSet)
//! 4. response cache and in-flight deduplication for reads
//!
//! Every layer except metrics expects a [`CallerIdentity`](crate::auth::CallerIdentity)
//! extension set by the authentication layer in front of this crate.

pub mod admission;
pub mod authorization;
pub mod response_cache;

pub use admission::*;
pub use authorization::*;
pub use response_cache::*;

use crate::observability::metrics::record_http_request;
use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Middleware to record HTTP request metrics
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();

    let response = next.run(req).await;
    record_http_request(&method, response.status().as_u16(), start.elapsed());

    response
}
