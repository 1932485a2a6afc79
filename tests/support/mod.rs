#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

use hyperapi::{router, AppState, GatewayConfig, GatewayMetrics};

/// Build the full gateway router from an inline YAML config.
pub fn app_from_yaml(yaml: &str) -> Router {
    let config = GatewayConfig::from_yaml(yaml).expect("test config must be valid");
    let state = AppState::new(
        &config,
        reqwest::Client::new(),
        Arc::new(GatewayMetrics::new().expect("metrics registry")),
    )
    .expect("test state must build");
    router(state)
}

/// Drive one request through the router. `headers` are (name, value) pairs.
pub async fn send(
    app: &Router,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Response {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::empty()).expect("request builds");
    app.clone().oneshot(request).await.expect("infallible")
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}
