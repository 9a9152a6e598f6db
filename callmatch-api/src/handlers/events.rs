use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::debug;

use callmatch_common::ringqueue::SubmitOutcome;

use super::app::ApiState;

/// A ring event reported by something other than the call monitor reader.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct EventPostRequestBody {
    origin_number: String,
    target_number: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct EventPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl EventPostResponse {
    fn outcome(outcome: SubmitOutcome) -> Json<Self> {
        Json(Self {
            outcome: Some(outcome.as_str().to_owned()),
            error: None,
        })
    }
}

pub async fn post(
    State(state): State<ApiState>,
    Json(payload): Json<EventPostRequestBody>,
) -> Result<Json<EventPostResponse>, (StatusCode, Json<EventPostResponse>)> {
    debug!("received payload: {:?}", payload);

    if payload.origin_number.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(EventPostResponse {
                outcome: None,
                error: Some("origin_number must not be empty".to_owned()),
            }),
        ));
    }

    match state
        .queue
        .submit_raw_event(&payload.origin_number, &payload.target_number)
        .await
    {
        SubmitOutcome::Failed => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            EventPostResponse::outcome(SubmitOutcome::Failed),
        )),
        outcome => Ok(EventPostResponse::outcome(outcome)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use callmatch_common::ringqueue::RingQueue;
    use http_body_util::BodyExt; // for `collect`
    use sqlx::PgPool;
    use tower::ServiceExt; // for `oneshot`

    use crate::handlers::app::add_routes;

    fn app(db: PgPool) -> Router {
        add_routes(
            Router::new(),
            ApiState {
                queue: RingQueue::new_from_pool(db, 10),
                match_window_secs: 300,
            },
        )
    }

    fn post_event(origin_number: &str, target_number: &str) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/events")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_string(&EventPostRequestBody {
                    origin_number: origin_number.to_owned(),
                    target_number: target_number.to_owned(),
                })
                .unwrap(),
            ))
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn event_inserted_then_duplicate(db: PgPool) {
        let app = app(db);

        let response = app
            .clone()
            .oneshot(post_event("0151234567890", "200893"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"outcome":"inserted"}"#);

        let response = app
            .oneshot(post_event("0151234567890", "200893"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"outcome":"duplicate_ignored"}"#);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn event_empty_origin(db: PgPool) {
        let response = app(db).oneshot(post_event("", "200893")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn event_payload_missing_fields(db: PgPool) {
        let response = app(db)
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/events")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"origin_number": "030111"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn event_storage_failure(db: PgPool) {
        sqlx::query("DROP TABLE ring_events")
            .execute(&db)
            .await
            .unwrap();

        let response = app(db)
            .oneshot(post_event("0151234567890", "200893"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"outcome":"failed"}"#);
    }
}
