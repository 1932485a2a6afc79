use std::collections::HashSet;

use async_trait::async_trait;
use axum::http::header::HeaderName;
use tracing::warn;

use crate::error::{ConfigError, GatewayError, GatewayResult};

use super::{Middleware, RequestCtx};

/// Static app-key authentication. The key read from the configured header
/// must be in the allowed set; on success it becomes the request principal,
/// which downstream stages (rate limiting) may key on.
pub struct AppKeyAuth {
    header: HeaderName,
    valid_keys: HashSet<String>,
}

impl AppKeyAuth {
    pub fn new(header: &str, keys: &[String], service_id: &str) -> Result<Self, ConfigError> {
        let header = header.parse::<HeaderName>().map_err(|_| {
            ConfigError::Invalid(format!(
                "service '{service_id}': invalid appkey header name '{header}'"
            ))
        })?;
        Ok(Self {
            header,
            valid_keys: keys.iter().cloned().collect(),
        })
    }
}

#[async_trait]
impl Middleware for AppKeyAuth {
    async fn on_request(&self, ctx: &mut RequestCtx) -> GatewayResult<()> {
        let key = ctx
            .headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .ok_or(GatewayError::Auth)?;
        if !self.valid_keys.contains(key) {
            warn!(header = %self.header, "rejected unknown app key");
            return Err(GatewayError::Auth);
        }
        ctx.principal = Some(key.to_string());
        Ok(())
    }
}
