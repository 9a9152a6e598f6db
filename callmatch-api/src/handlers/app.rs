use axum::{extract::State, http::StatusCode, routing, Router};
use tracing::error;

use callmatch_common::ringqueue::RingQueue;

use super::{events, matching};

#[derive(Clone)]
pub struct ApiState {
    pub queue: RingQueue,
    /// Used by `/match` when a request does not carry its own window.
    pub match_window_secs: i64,
}

pub fn add_routes(router: Router, state: ApiState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/_readiness",
            routing::get(readiness).with_state(state.clone()),
        )
        .route(
            "/events",
            routing::post(events::post).with_state(state.clone()),
        )
        .route("/match", routing::post(matching::post).with_state(state))
}

pub async fn index() -> &'static str {
    "callmatch api"
}

/// Ready once the database answers.
async fn readiness(State(state): State<ApiState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.queue.pool()).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            error!("readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
