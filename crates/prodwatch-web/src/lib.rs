//! Axum JSON API over the refresh pipeline and subscription scheduler.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prodwatch_core::{Artikul, ProductRecord};
use prodwatch_sched::{RefreshError, RefreshScheduler, ScheduleError};
use prodwatch_store::RegistryError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "prodwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<RefreshScheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<RefreshScheduler>) -> Self {
        Self { scheduler }
    }
}

#[derive(Debug, Deserialize)]
struct ProductRequest {
    artikul: Artikul,
}

#[derive(Debug, Serialize)]
struct ProductResponse {
    message: String,
    product: ProductRecord,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/products", post(create_product_handler))
        .route("/api/v1/subscribe/{artikul}", get(subscribe_handler))
        .route("/api/v1/unsubscribe/{artikul}", get(unsubscribe_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Synchronous fetch+upsert for one identifier.
async fn create_product_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProductRequest>,
) -> Response {
    let artikul = request.artikul;
    if artikul <= 0 {
        return detail_response(StatusCode::BAD_REQUEST, "artikul must be a positive integer");
    }

    match state.scheduler.refresh_once(artikul).await {
        Ok(product) => (
            StatusCode::OK,
            Json(ProductResponse {
                message: "Product upserted".to_string(),
                product,
            }),
        )
            .into_response(),
        Err(RefreshError::Fetch(err)) => {
            detail_response(StatusCode::NOT_FOUND, &err.to_string())
        }
        Err(RefreshError::Store(err)) => {
            error!(artikul, error = %err, "upsert failed");
            detail_response(StatusCode::BAD_REQUEST, "could not create product")
        }
    }
}

/// Creates a recurring refresh subscription for the artikul.
async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Path(artikul): Path<Artikul>,
) -> Response {
    if artikul <= 0 {
        return detail_response(StatusCode::BAD_REQUEST, "artikul must be a positive integer");
    }

    match state.scheduler.subscribe(artikul, None).await {
        Ok(sub) => message_response(format!(
            "Subscribed to updates for artikul {artikul} every {} seconds",
            sub.interval_secs
        )),
        Err(ScheduleError::Registry(RegistryError::AlreadyExists { .. })) => detail_response(
            StatusCode::BAD_REQUEST,
            &format!("subscription already exists for artikul {artikul}"),
        ),
        Err(ScheduleError::Probe(err)) => detail_response(StatusCode::NOT_FOUND, &err.to_string()),
        Err(err) => {
            error!(artikul, error = %err, "subscribe failed");
            detail_response(StatusCode::INTERNAL_SERVER_ERROR, "could not subscribe")
        }
    }
}

/// Removes the recurring refresh subscription for the artikul.
async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Path(artikul): Path<Artikul>,
) -> Response {
    match state.scheduler.unsubscribe(artikul).await {
        Ok(()) => message_response(format!("Unsubscribed from updates for artikul {artikul}")),
        Err(ScheduleError::Registry(RegistryError::NotFound { .. })) => detail_response(
            StatusCode::NOT_FOUND,
            &format!("no subscription found for artikul {artikul}"),
        ),
        Err(err) => {
            error!(artikul, error = %err, "unsubscribe failed");
            detail_response(StatusCode::INTERNAL_SERVER_ERROR, "could not unsubscribe")
        }
    }
}

fn message_response(message: String) -> Response {
    (StatusCode::OK, Json(json!({ "message": message }))).into_response()
}

fn detail_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use prodwatch_core::ProductSnapshot;
    use prodwatch_sched::RefreshScheduler;
    use prodwatch_store::memory::{MemoryRegistry, MemoryStore};
    use prodwatch_upstream::{FetchError, ProductFetcher};
    use tower::ServiceExt;

    use super::*;

    /// Fetcher that serves a fixed snapshot, or a lookup miss when empty.
    struct FixedFetcher {
        snapshot: Option<ProductSnapshot>,
    }

    #[async_trait]
    impl ProductFetcher for FixedFetcher {
        async fn fetch(&self, artikul: Artikul) -> Result<ProductSnapshot, FetchError> {
            match &self.snapshot {
                Some(snapshot) => Ok(ProductSnapshot {
                    artikul,
                    ..snapshot.clone()
                }),
                None => Err(FetchError::NotFound { artikul }),
            }
        }
    }

    async fn test_app(snapshot: Option<ProductSnapshot>) -> Router {
        let scheduler = RefreshScheduler::start(
            Arc::new(FixedFetcher { snapshot }),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRegistry::new()),
            prodwatch_core::DEFAULT_REFRESH_INTERVAL_SECS,
        )
        .await
        .expect("scheduler start");
        app(AppState::new(Arc::new(scheduler)))
    }

    fn widget() -> ProductSnapshot {
        ProductSnapshot {
            artikul: 555,
            name: "Widget".to_string(),
            price: 12900,
            rating: 4.5,
            stock: 7,
            fetched_at: Utc::now(),
        }
    }

    fn post_product(artikul: i64) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/products")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"artikul":{artikul}}}"#)))
            .expect("request")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn post_product_fetches_and_upserts() {
        let app = test_app(Some(widget())).await;
        let response = app.oneshot(post_product(555)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Product upserted");
        assert_eq!(body["product"]["artikul"], 555);
        assert_eq!(body["product"]["name"], "Widget");
        assert_eq!(body["product"]["price"], 12900);
        assert_eq!(body["product"]["stock"], 7);
    }

    #[tokio::test]
    async fn post_product_for_unknown_artikul_is_404() {
        let app = test_app(None).await;
        let response = app.oneshot(post_product(1)).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert!(body["detail"].as_str().expect("detail").contains("artikul 1"));
    }

    #[tokio::test]
    async fn post_product_rejects_non_positive_artikul() {
        let app = test_app(Some(widget())).await;
        let response = app.oneshot(post_product(0)).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscribe_then_duplicate_conflicts() {
        let app = test_app(Some(widget())).await;

        let first = app
            .clone()
            .oneshot(get_request("/api/v1/subscribe/12345"))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);
        let body = body_json(first).await;
        assert!(body["message"]
            .as_str()
            .expect("message")
            .contains("every 1800 seconds"));

        let second = app
            .oneshot(get_request("/api/v1/subscribe/12345"))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscribe_to_unfetchable_artikul_is_404() {
        let app = test_app(None).await;
        let response = app
            .oneshot(get_request("/api/v1/subscribe/42"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_404() {
        let app = test_app(Some(widget())).await;
        let response = app
            .oneshot(get_request("/api/v1/unsubscribe/99999"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert!(body["detail"]
            .as_str()
            .expect("detail")
            .contains("no subscription"));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_round_trip() {
        let app = test_app(Some(widget())).await;

        let subscribe = app
            .clone()
            .oneshot(get_request("/api/v1/subscribe/7"))
            .await
            .expect("response");
        assert_eq!(subscribe.status(), StatusCode::OK);

        let unsubscribe = app
            .clone()
            .oneshot(get_request("/api/v1/unsubscribe/7"))
            .await
            .expect("response");
        assert_eq!(unsubscribe.status(), StatusCode::OK);

        // A second unsubscribe finds nothing.
        let again = app
            .oneshot(get_request("/api/v1/unsubscribe/7"))
            .await
            .expect("response");
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }
}
