use std::net::IpAddr;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;

use crate::config::MiddlewareSpec;
use crate::error::{ConfigError, GatewayResult};

pub mod acl;
pub mod app_key;
pub mod header_rewrite;
pub mod jwt;
pub mod rate_limit;

/// Mutable per-request state threaded through the pipeline. Owned by the
/// dispatcher for the duration of one request.
pub struct RequestCtx {
    pub method: Method,
    /// Path relative to the owning service (prefix already stripped); always
    /// begins with '/'.
    pub rel_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Authenticated identity: the app key, or the JWT `sub` claim.
    pub principal: Option<String>,
    pub client_ip: Option<IpAddr>,
}

/// One stage in a service's pipeline.
///
/// Request-phase stages run in declared order and may short-circuit by
/// returning an error, which becomes the terminal response. Response-phase
/// stages run in reverse declared order over whatever response is leaving the
/// gateway, terminal or proxied.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_request(&self, ctx: &mut RequestCtx) -> GatewayResult<()>;

    fn on_response(&self, _resp: &mut Response) {}
}

/// Compile a config variant into a pipeline stage. Key material and header
/// names are parsed here so bad config fails at startup, not per request.
pub fn build(
    spec: &MiddlewareSpec,
    service_id: &str,
) -> Result<Box<dyn Middleware>, ConfigError> {
    match spec {
        MiddlewareSpec::HeaderRewrite {
            request_add,
            request_remove,
            response_add,
            response_remove,
        } => Ok(Box::new(header_rewrite::HeaderRewrite::new(
            request_add,
            request_remove,
            response_add,
            response_remove,
            service_id,
        )?)),
        MiddlewareSpec::Acl {
            allow_prefixes,
            deny_prefixes,
        } => Ok(Box::new(acl::Acl::new(
            allow_prefixes.clone(),
            deny_prefixes.clone(),
        ))),
        MiddlewareSpec::AppKey { header, keys } => {
            Ok(Box::new(app_key::AppKeyAuth::new(header, keys, service_id)?))
        }
        MiddlewareSpec::Jwt {
            header,
            scheme,
            algorithms,
            keys,
            required_claims,
            clock_skew_sec,
        } => Ok(Box::new(jwt::JwtAuth::new(
            header,
            scheme,
            algorithms,
            keys,
            required_claims.clone(),
            *clock_skew_sec,
            service_id,
        )?)),
        MiddlewareSpec::RateLimit {
            capacity,
            rate,
            key,
        } => Ok(Box::new(rate_limit::RateLimit::new(*capacity, *rate, *key))),
    }
}
