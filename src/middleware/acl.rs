use async_trait::async_trait;

use crate::error::{GatewayError, GatewayResult};

use super::{Middleware, RequestCtx};

/// Path filter over the service-relative path. When an allow list is present
/// it is authoritative: anything it does not cover is rejected. Otherwise the
/// deny list knocks out matching paths. Rejections are 404s with empty bodies
/// and never reach an upstream.
pub struct Acl {
    allow_prefixes: Vec<String>,
    deny_prefixes: Vec<String>,
}

impl Acl {
    pub fn new(allow_prefixes: Vec<String>, deny_prefixes: Vec<String>) -> Self {
        Self {
            allow_prefixes,
            deny_prefixes,
        }
    }

    fn permits(&self, path: &str) -> bool {
        if !self.allow_prefixes.is_empty() {
            return self
                .allow_prefixes
                .iter()
                .any(|prefix| prefix_covers(prefix, path));
        }
        !self
            .deny_prefixes
            .iter()
            .any(|prefix| prefix_covers(prefix, path))
    }
}

/// Prefixes bind on path-segment boundaries: `/api/user` covers `/api/user`
/// and `/api/user/...` but not `/api/user2`.
fn prefix_covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[async_trait]
impl Middleware for Acl {
    async fn on_request(&self, ctx: &mut RequestCtx) -> GatewayResult<()> {
        if self.permits(&ctx.rel_path) {
            Ok(())
        } else {
            Err(GatewayError::AclDeny)
        }
    }
}
