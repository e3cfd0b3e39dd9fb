use crate::service::{FaceService, ServiceError};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facemirror_core::{ErrorKind, MatchResult};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Multipart field names accepted for the probe image.
const IMAGE_FIELDS: [&str; 2] = ["image", "file"];

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    /// Request body refused before it reached a handler.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ApiError {
    /// Oversized bodies keep their 413; every other rejection is a 400.
    fn rejected(status: StatusCode, message: String) -> Self {
        let status = if status == StatusCode::PAYLOAD_TOO_LARGE {
            status
        } else {
            StatusCode::BAD_REQUEST
        };
        ApiError::Rejected { status, message }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) | ApiError::Rejected { .. } => ErrorKind::ValidationError,
            ApiError::Service(e) => e.kind(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Rejected { status, .. } => *status,
            other => status_for(other.kind()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::rejected(rejection.status(), rejection.body_text())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::DecodeError => StatusCode::BAD_REQUEST,
        ErrorKind::StoreError => StatusCode::BAD_GATEWAY,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = self.status();
        let message = self.to_string();
        if kind == ErrorKind::InternalError {
            tracing::error!(%message, "request failed");
        } else {
            tracing::warn!(%kind, %message, "request rejected");
        }
        let body = MatchResult::error(kind, message);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub image: String,
}

pub fn router(service: Arc<FaceService>) -> Router {
    let body_limit = service.config().max_upload_bytes;
    Router::new()
        .route("/recognize", post(recognize))
        .route("/compare_models", post(compare_models))
        .route("/register", post(register))
        .route("/sync", post(sync_now))
        .route("/sync/plan", get(sync_plan))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Pull the probe image out of a multipart body.
async fn read_image(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::rejected(e.status(), format!("malformed multipart body: {}", e.body_text()))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if !IMAGE_FIELDS.contains(&name.as_str()) {
            tracing::debug!(field = %name, "ignoring multipart field");
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| {
                ApiError::rejected(e.status(), format!("cannot read image field: {}", e.body_text()))
            })?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("image field is empty".into()));
        }
        return Ok(bytes.to_vec());
    }
    Err(ApiError::BadRequest("no image provided".into()))
}

async fn recognize(
    State(service): State<Arc<FaceService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let bytes = read_image(multipart?).await?;
    let result = service.recognize(&bytes).await?;
    let status = result.error_kind().map(status_for).unwrap_or(StatusCode::OK);
    Ok((status, Json(result)).into_response())
}

async fn compare_models(
    State(service): State<Arc<FaceService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let bytes = read_image(multipart?).await?;
    let comparison = service.compare_models(&bytes).await?;
    Ok(Json(json!({ "status": "success", "models": comparison })).into_response())
}

async fn register(
    State(service): State<Arc<FaceService>>,
    request: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let outcome = service.register(&request.name, &request.image).await?;
    let message = format!("Face for {} registered", outcome.name);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": message,
            "name": outcome.name,
            "key": outcome.key,
            "sync": outcome.sync,
        })),
    )
        .into_response())
}

async fn sync_now(State(service): State<Arc<FaceService>>) -> Result<Response, ApiError> {
    let report = service.sync_now().await?;
    let status = if report.is_complete() { "synced" } else { "partial" };
    Ok(Json(json!({ "status": status, "report": report })).into_response())
}

async fn sync_plan(State(service): State<Arc<FaceService>>) -> Result<Response, ApiError> {
    let plan = service.plan().await?;
    Ok(Json(json!({ "status": "planned", "plan": plan })).into_response())
}

async fn health(State(service): State<Arc<FaceService>>) -> Response {
    Json(json!({ "status": "ok", "service": service.status() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{b64, stripes_png, test_service, test_service_with};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    const BOUNDARY: &str = "facemirror-test-boundary";

    fn multipart_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"probe.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, value: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_recognize_known_face() {
        let (_dir, _store, service) = test_service(vec![("alice/a.png".into(), stripes_png(4))]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/recognize", "image", &stripes_png(4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "recognized");
        assert_eq!(body["name"], "alice");
    }

    #[tokio::test]
    async fn test_recognize_accepts_file_field() {
        let (_dir, _store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/recognize", "file", &stripes_png(4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "unrecognized");
    }

    #[tokio::test]
    async fn test_recognize_without_image_is_bad_request() {
        let (_dir, _store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/recognize", "photo", &stripes_png(4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_recognize_non_multipart_is_structured_bad_request() {
        let (_dir, _store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(json_request("/recognize", json!({ "image": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_structured_413() {
        let (_dir, _store, service) =
            test_service_with(vec![], |c| c.max_upload_bytes = 1024);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/recognize", "image", &vec![7u8; 4096]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_recognize_garbage_is_decode_error() {
        let (_dir, _store, service) = test_service(vec![("alice/a.png".into(), stripes_png(4))]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/recognize", "image", b"not an image"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "decode_error");
    }

    #[tokio::test]
    async fn test_register_then_plan_is_empty() {
        let (_dir, store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .clone()
            .oneshot(json_request(
                "/register",
                json!({ "name": "dave", "image": b64(&stripes_png(4)) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Face for dave registered");
        assert_eq!(store.keys().len(), 1);

        let response = app
            .oneshot(Request::get("/sync/plan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "planned");
        assert_eq!(body["plan"]["to_download"], json!([]));
        assert_eq!(body["plan"]["to_delete"], json!([]));
    }

    #[tokio::test]
    async fn test_register_missing_field_is_structured_bad_request() {
        let (_dir, store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(json_request("/register", json!({ "name": "dave" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation_error");
        assert!(body["message"].as_str().unwrap().contains("image"));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_register_bad_name_is_bad_request() {
        let (_dir, _store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(json_request(
                "/register",
                json!({ "name": "../etc", "image": b64(&stripes_png(4)) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_register_store_down_is_bad_gateway() {
        let (_dir, store, service) = test_service(vec![]);
        store.set_unavailable(true);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(json_request(
                "/register",
                json!({ "name": "erin", "image": b64(&stripes_png(4)) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["kind"], "store_error");
    }

    #[tokio::test]
    async fn test_compare_models_ordered() {
        let (_dir, _store, service) = test_service(vec![("alice/a.png".into(), stripes_png(4))]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(multipart_request("/compare_models", "image", &stripes_png(4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["models"]["gray-32"]["status"], "recognized");
        assert_eq!(body["models"].as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sync_reports_downloads() {
        let (_dir, _store, service) = test_service(vec![
            ("alice/a.png".into(), stripes_png(4)),
            ("bob/b.png".into(), stripes_png(8)),
        ]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(Request::post("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "synced");
        assert_eq!(body["report"]["downloaded"], 2);
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, _store, service) = test_service(vec![]);
        let app = router(Arc::new(service));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"]["models"][0], "gray-32");
    }
}
