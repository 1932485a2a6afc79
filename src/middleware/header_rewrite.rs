use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue};
use axum::response::Response;

use crate::error::{ConfigError, GatewayResult};

use super::{Middleware, RequestCtx};

/// Adds and removes headers on both sides of the proxy hop. Removals run
/// before additions so an add can overwrite a just-removed name.
#[derive(Debug)]
pub struct HeaderRewrite {
    request_add: Vec<(HeaderName, HeaderValue)>,
    request_remove: Vec<HeaderName>,
    response_add: Vec<(HeaderName, HeaderValue)>,
    response_remove: Vec<HeaderName>,
}

impl HeaderRewrite {
    pub fn new(
        request_add: &BTreeMap<String, String>,
        request_remove: &[String],
        response_add: &BTreeMap<String, String>,
        response_remove: &[String],
        service_id: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            request_add: parse_pairs(request_add, service_id)?,
            request_remove: parse_names(request_remove, service_id)?,
            response_add: parse_pairs(response_add, service_id)?,
            response_remove: parse_names(response_remove, service_id)?,
        })
    }
}

fn parse_pairs(
    raw: &BTreeMap<String, String>,
    service_id: &str,
) -> Result<Vec<(HeaderName, HeaderValue)>, ConfigError> {
    raw.iter()
        .map(|(name, value)| {
            let name = name.parse::<HeaderName>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "service '{service_id}': invalid header name '{name}'"
                ))
            })?;
            let value = value.parse::<HeaderValue>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "service '{service_id}': invalid header value for '{name}'"
                ))
            })?;
            Ok((name, value))
        })
        .collect()
}

fn parse_names(raw: &[String], service_id: &str) -> Result<Vec<HeaderName>, ConfigError> {
    raw.iter()
        .map(|name| {
            name.parse::<HeaderName>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "service '{service_id}': invalid header name '{name}'"
                ))
            })
        })
        .collect()
}

#[async_trait]
impl Middleware for HeaderRewrite {
    async fn on_request(&self, ctx: &mut RequestCtx) -> GatewayResult<()> {
        for name in &self.request_remove {
            ctx.headers.remove(name);
        }
        for (name, value) in &self.request_add {
            ctx.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn on_response(&self, resp: &mut Response) {
        let headers = resp.headers_mut();
        for name in &self.response_remove {
            headers.remove(name);
        }
        for (name, value) in &self.response_add {
            headers.insert(name.clone(), value.clone());
        }
    }
}
