//! Payload normalizer.
//!
//! Unary endpoints accept YAML as an alternate encoding. When the request's
//! `Content-Type` indicates YAML the body is parsed into a generic tree and
//! re-serialized as JSON before reaching the extractors; everything else
//! passes through untouched. The original content type is preserved in
//! `X-Original-Content-Type`.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;

const YAML_CONTENT_TYPES: &[&str] = &[
    "application/yaml",
    "application/x-yaml",
    "text/yaml",
    "text/x-yaml",
];

/// Bodies above this size are rejected before parsing.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const ORIGINAL_CONTENT_TYPE_HEADER: &str = "x-original-content-type";

fn is_yaml(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    YAML_CONTENT_TYPES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

pub async fn yaml_body_middleware(request: Request, next: Next) -> Result<Response, ApiError> {
    let original = match request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| is_yaml(ct))
    {
        Some(ct) => ct.to_string(),
        None => return Ok(next.run(request).await),
    };

    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::InvalidArgument(format!("unreadable request body: {}", e)))?;

    let tree: serde_yaml::Value = serde_yaml::from_slice(&bytes)
        .map_err(|e| ApiError::InvalidArgument(format!("malformed yaml: {}", e)))?;
    let json = serde_json::to_vec(&tree)
        .map_err(|e| ApiError::InvalidArgument(format!("yaml not representable as json: {}", e)))?;

    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(&original) {
        parts
            .headers
            .insert(ORIGINAL_CONTENT_TYPE_HEADER, value);
    }
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(json.len()));

    Ok(next.run(Request::from_parts(parts, Body::from(json))).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::to_bytes,
        http::{Request as HttpRequest, StatusCode},
        middleware::from_fn,
        routing::post,
        Json, Router,
    };
    use tower::ServiceExt;

    async fn echo(Json(value): Json<serde_json::Value>) -> Json<serde_json::Value> {
        Json(value)
    }

    fn app() -> Router {
        Router::new()
            .route("/echo", post(echo))
            .layer(from_fn(yaml_body_middleware))
    }

    #[test]
    fn test_yaml_content_type_detection() {
        assert!(is_yaml("application/yaml"));
        assert!(is_yaml("application/x-yaml; charset=utf-8"));
        assert!(is_yaml("TEXT/YAML"));
        assert!(is_yaml("text/x-yaml"));
        assert!(!is_yaml("application/json"));
        assert!(!is_yaml("text/plain"));
    }

    #[tokio::test]
    async fn test_yaml_body_is_translated() {
        let request = HttpRequest::post("/echo")
            .header("content-type", "application/yaml")
            .body(Body::from("name: ubuntu\nversion: 2\n"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"name": "ubuntu", "version": 2}));
    }

    #[tokio::test]
    async fn test_json_passes_untouched() {
        let request = HttpRequest::post("/echo")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"ubuntu"}"#))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_yaml_is_bad_request() {
        let request = HttpRequest::post("/echo")
            .header("content-type", "text/yaml")
            .body(Body::from(": : : not yaml ["))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
