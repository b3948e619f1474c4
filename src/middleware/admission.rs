use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::auth::CallerIdentity;
use crate::error::AppError;

/// Hold the request until the caller's client is admitted
///
/// The inner service is not called for requests that are rejected or time
/// out in the queue.
pub async fn admission_middleware(
    State(controller): State<Arc<AdmissionController>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client_id = req
        .extensions()
        .get::<CallerIdentity>()
        .map(|caller| caller.client_id().to_string())
        .ok_or(AppError::Unauthenticated)?;

    let response = controller.admit(&client_id, next.run(req)).await?;
    Ok(response)
}
