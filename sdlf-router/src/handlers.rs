use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing, Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, error};

use sdlf_core::PipelineError;

use crate::router::{EventRouter, RouteOutcome};

#[derive(Debug, Serialize)]
pub struct EventResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn add_routes(
    router: Router,
    event_router: Arc<EventRouter>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // Stateless, nothing to report beyond axum
        .route(
            "/parameters/:team/:dataset",
            routing::get(get_parameters).with_state(event_router.clone()),
        )
        .route(
            "/events",
            routing::post(post_event)
                .with_state(event_router)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "sdlf router"
}

pub async fn post_event(
    State(event_router): State<Arc<EventRouter>>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<EventResponse>), (StatusCode, Json<EventResponse>)> {
    debug!("received event: {:?}", payload);

    match event_router.route(&payload).await {
        Ok(outcome) => {
            let queue = match &outcome {
                RouteOutcome::Enqueued { queue, .. } => Some(queue.clone()),
                _ => None,
            };
            Ok((
                StatusCode::ACCEPTED,
                Json(EventResponse {
                    outcome: Some(outcome.as_str()),
                    queue,
                    error: None,
                }),
            ))
        }
        Err(e) => Err(error_response(e)),
    }
}

pub async fn get_parameters(
    State(event_router): State<Arc<EventRouter>>,
    Path((team, dataset)): Path<(String, String)>,
) -> Result<Json<BTreeMap<String, String>>, (StatusCode, Json<EventResponse>)> {
    event_router
        .parameters(&team, &dataset)
        .await
        .map(Json)
        .map_err(error_response)
}

fn error_response(err: PipelineError) -> (StatusCode, Json<EventResponse>) {
    let status = match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Lookup(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            error!("internal error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(EventResponse {
            outcome: None,
            queue: None,
            error: Some(err.to_string()),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{self, Request},
    };
    use http_body_util::BodyExt; // for `collect`
    use sdlf_core::registry::DatasetStore;
    use sdlf_core::{DatasetConfig, MockBackends};
    use tower::ServiceExt; // for `oneshot`

    fn app(backends: &MockBackends) -> Router {
        add_routes(
            Router::new(),
            Arc::new(EventRouter::new(backends.services())),
            1_000_000,
            10,
        )
    }

    #[tokio::test]
    async fn index() {
        let response = app(&MockBackends::new())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"sdlf router");
    }

    #[tokio::test]
    async fn parameters_resolve_stage_resources() {
        let backends = MockBackends::new();
        backends
            .registry
            .put_dataset(&DatasetConfig {
                team: "adtech".to_string(),
                dataset: "datasetA".to_string(),
                pipeline: "insights".to_string(),
                min_items: Default::default(),
                max_items: Default::default(),
                stage_a_transform: "copy".to_string(),
                stage_b_transform: "copy".to_string(),
            })
            .await
            .unwrap();

        let response = app(&backends)
            .oneshot(
                Request::builder()
                    .uri("/parameters/adtech/datasetA")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body["/prefix/SDLF/adtech/datasetA/StageAQueue"],
            "prefix-adtech-insights-queue-a.fifo"
        );

        let response = app(&backends)
            .oneshot(
                Request::builder()
                    .uri("/parameters/adtech/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_event_shape_is_a_bad_request() {
        let response = app(&MockBackends::new())
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/events")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"detail-type": "Object Archived"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("Object Archived"));
    }

    #[tokio::test]
    async fn unresolvable_object_is_unprocessable() {
        let response = app(&MockBackends::new())
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/events")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"detail-type":"Object Created","detail":{"bucket":{"name":"prefix-raw-bucket"},"object":{"key":"nobody/nothing/f.json"}}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
