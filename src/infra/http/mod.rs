mod engagement;
pub mod error;
mod middleware;
pub mod realtime;
pub mod visitor;

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::application::{
    engagement::EngagementDeduper, error::ErrorReport, presence::PresenceStore,
};
use crate::cache::{CacheBackend, CacheError};

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub presence: Arc<PresenceStore>,
    pub engagement: Arc<EngagementDeduper>,
    pub cache: Arc<dyn CacheBackend>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/{kind}/{id}/like", post(engagement::like))
        .route("/api/{kind}/{id}/read", post(engagement::read))
        .route("/api/{kind}/{id}/engagement", get(engagement::summary))
        .route("/realtime", get(realtime::realtime))
        .route("/_health/cache", get(cache_health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn cache_health(State(state): State<HttpState>) -> Response {
    cache_health_response(state.cache.ping().await)
}

fn cache_health_response(result: Result<(), CacheError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::cache_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
