use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use callmatch_common::ringqueue::now_epoch_seconds;

use super::app::ApiState;

/// Ask for the caller behind a webhook that arrived at `arrival_time`.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
pub struct MatchPostRequestBody {
    /// Seconds since epoch. Defaults to now.
    #[serde(default)]
    arrival_time: Option<i64>,
    #[serde(default)]
    window_seconds: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MatchPostResponse {
    origin_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn bad_request(message: &str) -> (StatusCode, Json<MatchPostResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(MatchPostResponse {
            origin_number: None,
            error: Some(message.to_owned()),
        }),
    )
}

pub async fn post(
    State(state): State<ApiState>,
    Json(payload): Json<MatchPostRequestBody>,
) -> Result<Json<MatchPostResponse>, (StatusCode, Json<MatchPostResponse>)> {
    debug!("received payload: {:?}", payload);

    let window_seconds = payload.window_seconds.unwrap_or(state.match_window_secs);
    if window_seconds < 0 {
        return Err(bad_request("window_seconds must not be negative"));
    }
    let arrival_time = payload.arrival_time.unwrap_or_else(now_epoch_seconds);

    match state.queue.find_match(arrival_time, window_seconds).await {
        Ok(origin_number) => Ok(Json(MatchPostResponse {
            origin_number,
            error: None,
        })),
        Err(e) => {
            error!("failed to match webhook arriving at {}: {}", arrival_time, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MatchPostResponse {
                    origin_number: None,
                    error: Some("storage unavailable".to_owned()),
                }),
            ))
        }
    }
}
