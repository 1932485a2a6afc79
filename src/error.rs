use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Fatal configuration problems. These abort startup with exit code 3 and are
/// never produced on the request path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("service '{service}': failed to parse JWT public key: {reason}")]
    JwtKey { service: String, reason: String },
}

/// Per-request failures, each mapped to exactly one gateway response.
///
/// Everything here is recovered locally into a status code; the client never
/// sees an upstream error body unless the upstream actually produced the
/// response (pass-through is handled outside this enum).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Auth,
    #[error("path denied by acl")]
    AclDeny,
    #[error("no service matches path")]
    NoRoute,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("circuit breaker open for upstream '{upstream_id}'")]
    BreakerOpen { upstream_id: String },
    #[error("service concurrency limit reached")]
    ConcurrencyReject,
    #[error("upstream '{upstream_id}' timed out")]
    UpstreamTimeout {
        upstream_id: String,
        mapped_status: StatusCode,
    },
    #[error("upstream '{upstream_id}' transport error: {reason}")]
    UpstreamTransport { upstream_id: String, reason: String },
    #[error("request body unreadable or too large")]
    BadBody,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::Auth => (
                StatusCode::UNAUTHORIZED,
                Body::from(r#"{"error":"unauthorized"}"#),
            ),
            // ACL rejections are indistinguishable from unknown paths on
            // purpose, but carry an empty body.
            GatewayError::AclDeny => (StatusCode::NOT_FOUND, Body::empty()),
            GatewayError::NoRoute => (
                StatusCode::NOT_FOUND,
                Body::from(r#"{"error":"not found"}"#),
            ),
            GatewayError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, Body::empty()),
            GatewayError::BreakerOpen { .. } => (
                StatusCode::BAD_GATEWAY,
                Body::from(r#"{"error":"bad gateway"}"#),
            ),
            GatewayError::ConcurrencyReject => (
                StatusCode::BAD_GATEWAY,
                Body::from(r#"{"error":"bad gateway"}"#),
            ),
            GatewayError::UpstreamTimeout { mapped_status, .. } => (
                *mapped_status,
                Body::from(r#"{"error":"gateway timeout"}"#),
            ),
            GatewayError::UpstreamTransport { .. } => (
                StatusCode::BAD_GATEWAY,
                Body::from(r#"{"error":"bad gateway"}"#),
            ),
            GatewayError::BadBody => (StatusCode::BAD_REQUEST, Body::empty()),
        };

        let mut response = Response::builder()
            .status(status)
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

        // Everything except the empty-bodied rejections carries a JSON body.
        if matches!(
            self,
            GatewayError::Auth
                | GatewayError::NoRoute
                | GatewayError::BreakerOpen { .. }
                | GatewayError::ConcurrencyReject
                | GatewayError::UpstreamTimeout { .. }
                | GatewayError::UpstreamTransport { .. }
        ) {
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        if let GatewayError::BreakerOpen { .. } = &self {
            response
                .headers_mut()
                .insert("X-CB-State", HeaderValue::from_static("open"));
        }
        // Timeouts and transport errors happen after an upstream was picked,
        // so the response still names it.
        match &self {
            GatewayError::UpstreamTimeout { upstream_id, .. }
            | GatewayError::UpstreamTransport { upstream_id, .. } => {
                if let Ok(value) = HeaderValue::from_str(upstream_id) {
                    response.headers_mut().insert("X-Upstream-Id", value);
                }
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_open_carries_cb_state_header() {
        let resp = GatewayError::BreakerOpen {
            upstream_id: "11".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("X-CB-State").unwrap(), "open");
        assert!(resp.headers().get("X-Upstream-Id").is_none());
    }

    #[test]
    fn rate_limited_is_429_with_empty_body() {
        let resp = GatewayError::RateLimited.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn timeout_echoes_upstream_id_and_mapped_status() {
        let resp = GatewayError::UpstreamTimeout {
            upstream_id: "21".into(),
            mapped_status: StatusCode::GATEWAY_TIMEOUT,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(resp.headers().get("X-Upstream-Id").unwrap(), "21");
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
