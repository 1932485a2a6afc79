use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::middleware::RequestCtx;
use crate::state::AppState;
use crate::upstream;

/// Every path goes through the fallback: services own arbitrary prefixes, so
/// route matching is ours, not axum's. `/healthz` and `/metrics` are reserved
/// and answered only when no service owns the path.
pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let mut response = handle(&state, req).await;
    // Gateway-wide response contract: no upstream Server banner, and every
    // response names the gateway.
    response.headers_mut().remove(header::SERVER);
    response
        .headers_mut()
        .insert("Powered-By", HeaderValue::from_static("hyperapi"));
    response
}

async fn handle(state: &AppState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let Some(service) = state.find_service(&path) else {
        return match path.as_str() {
            "/healthz" => "ok".into_response(),
            "/metrics" => state.metrics.render().unwrap_or_else(|err| {
                warn!(?err, "failed to render metrics");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }),
            _ => {
                debug!(%path, "no service owns path");
                state.metrics.record_request("-", "no_route");
                GatewayError::NoRoute.into_response()
            }
        };
    };

    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(service = %service.id, ?err, "failed to buffer request body");
            state.metrics.record_request(&service.id, "bad_body");
            return GatewayError::BadBody.into_response();
        }
    };

    let mut ctx = RequestCtx {
        method: parts.method,
        rel_path: service.rel_path(&path).to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        principal: None,
        client_ip,
    };

    // Request phase, declared order. The first short-circuit wins but the
    // response chain below still sees its response.
    let mut short_circuit = None;
    for stage in &service.middlewares {
        if let Err(err) = stage.on_request(&mut ctx).await {
            short_circuit = Some(err);
            break;
        }
    }

    let mut response = match short_circuit {
        Some(err) => {
            state.metrics.record_request(&service.id, outcome_label(&err));
            err.into_response()
        }
        None => match upstream::dispatch_upstream(state, service, &ctx).await {
            Ok(response) => {
                state.metrics.record_request(&service.id, "proxied");
                response
            }
            Err(err) => {
                state.metrics.record_request(&service.id, outcome_label(&err));
                err.into_response()
            }
        },
    };

    // Response phase, reverse declared order.
    for stage in service.middlewares.iter().rev() {
        stage.on_response(&mut response);
    }
    response
}

fn outcome_label(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Auth => "auth",
        GatewayError::AclDeny => "acl_deny",
        GatewayError::NoRoute => "no_route",
        GatewayError::RateLimited => "rate_limited",
        GatewayError::BreakerOpen { .. } => "breaker_open",
        GatewayError::ConcurrencyReject => "concurrency_reject",
        GatewayError::UpstreamTimeout { .. } => "timeout",
        GatewayError::UpstreamTransport { .. } => "transport",
        GatewayError::BadBody => "bad_body",
    }
}
