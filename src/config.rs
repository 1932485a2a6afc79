use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root of the YAML config file. Loaded once at startup; immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Listen address; overridable by `--listen` on the command line.
    #[serde(default)]
    pub listen: Option<String>,
    /// Cap on buffered request bodies before forwarding.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub id: String,
    /// Path prefix owning this service, matched on segment boundaries.
    pub prefix: String,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareSpec>,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub lb: LbPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Status returned when an upstream call exceeds `timeout_ms`. 504 is the
    /// default; 502 is the legacy mapping some deployments still expect.
    #[serde(default = "default_timeout_status")]
    pub timeout_status: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[serde(alias = "random_weighted")]
    Random,
    Hash,
    #[serde(alias = "least_connection")]
    LeastConn,
    #[serde(alias = "latency_weighted")]
    Latency,
}

impl Default for LbPolicy {
    fn default() -> Self {
        LbPolicy::Random
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total outbound attempts per request; 1 means no retry. Only transport
    /// failures are retried, never HTTP statuses or timeouts.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_cb_threshold")]
    pub threshold: u32,
    #[serde(default = "default_cb_retry_delay")]
    pub retry_delay_sec: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_cb_threshold(),
            retry_delay_sec: default_cb_retry_delay(),
        }
    }
}

/// Which identity a rate-limit bucket is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKey {
    PerService,
    PerClientKey,
    PerIp,
}

impl Default for RateKey {
    fn default() -> Self {
        RateKey::PerService
    }
}

/// Tagged middleware variants as they appear under `middlewares:` in YAML.
/// The tag is the `type` field; each variant compiles into one pipeline stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareSpec {
    HeaderRewrite {
        #[serde(default)]
        request_add: BTreeMap<String, String>,
        #[serde(default)]
        request_remove: Vec<String>,
        #[serde(default)]
        response_add: BTreeMap<String, String>,
        #[serde(default)]
        response_remove: Vec<String>,
    },
    Acl {
        #[serde(default)]
        allow_prefixes: Vec<String>,
        #[serde(default)]
        deny_prefixes: Vec<String>,
    },
    #[serde(rename = "appkey")]
    AppKey {
        #[serde(default = "default_appkey_header")]
        header: String,
        keys: Vec<String>,
    },
    Jwt {
        #[serde(default = "default_jwt_header")]
        header: String,
        #[serde(default = "default_jwt_scheme")]
        scheme: String,
        #[serde(default = "default_jwt_algorithms")]
        algorithms: Vec<String>,
        keys: Vec<String>,
        #[serde(default = "default_required_claims")]
        required_claims: Vec<String>,
        #[serde(default = "default_clock_skew")]
        clock_skew_sec: u64,
    },
    #[serde(rename = "ratelimit")]
    RateLimit {
        capacity: u32,
        rate: f64,
        #[serde(default)]
        key: RateKey,
    },
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_max_concurrent() -> usize {
    64
}
fn default_timeout_status() -> u16 {
    504
}
fn default_weight() -> u32 {
    1
}
fn default_attempts() -> u32 {
    1
}
fn default_cb_threshold() -> u32 {
    3
}
fn default_cb_retry_delay() -> f64 {
    3.0
}
fn default_appkey_header() -> String {
    "X-APP-KEY".to_string()
}
fn default_jwt_header() -> String {
    "Authorization".to_string()
}
fn default_jwt_scheme() -> String {
    "Bearer".to_string()
}
fn default_jwt_algorithms() -> Vec<String> {
    vec!["ES256".to_string()]
}
fn default_required_claims() -> Vec<String> {
    vec!["sub".to_string(), "exp".to_string(), "iat".to_string()]
}
fn default_clock_skew() -> u64 {
    30
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("no services defined".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes must be > 0".into()));
        }

        let mut ids = HashSet::new();
        let mut prefixes = HashSet::new();
        for service in &self.services {
            if !ids.insert(service.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service id '{}'",
                    service.id
                )));
            }
            if !service.prefix.starts_with('/') || service.prefix.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': prefix must start with '/' and be non-root",
                    service.id
                )));
            }
            if !prefixes.insert(service.prefix.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service prefix '{}'",
                    service.prefix
                )));
            }
            service.validate()?;
        }
        Ok(())
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "service '{}': upstream set must be non-empty",
                self.id
            )));
        }
        let mut upstream_ids = HashSet::new();
        for upstream in &self.upstreams {
            if !upstream_ids.insert(upstream.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': duplicate upstream id '{}'",
                    self.id, upstream.id
                )));
            }
            if upstream.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': upstream '{}' weight must be >= 1",
                    self.id, upstream.id
                )));
            }
            reqwest::Url::parse(&upstream.url).map_err(|err| {
                ConfigError::Invalid(format!(
                    "service '{}': upstream '{}' url '{}': {err}",
                    self.id, upstream.id, upstream.url
                ))
            })?;
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "service '{}': timeout_ms must be > 0",
                self.id
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(format!(
                "service '{}': max_concurrent must be > 0",
                self.id
            )));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "service '{}': retry.attempts must be >= 1",
                self.id
            )));
        }
        if self.circuit_breaker.threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "service '{}': circuit_breaker.threshold must be >= 1",
                self.id
            )));
        }
        if !(self.timeout_status == 502 || self.timeout_status == 504) {
            return Err(ConfigError::Invalid(format!(
                "service '{}': timeout_status must be 502 or 504",
                self.id
            )));
        }
        for middleware in &self.middlewares {
            middleware.validate(&self.id)?;
        }
        Ok(())
    }
}

impl MiddlewareSpec {
    fn validate(&self, service_id: &str) -> Result<(), ConfigError> {
        match self {
            MiddlewareSpec::AppKey { keys, .. } => {
                if keys.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "service '{service_id}': appkey middleware needs at least one key"
                    )));
                }
            }
            MiddlewareSpec::Jwt {
                keys, algorithms, ..
            } => {
                if keys.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "service '{service_id}': jwt middleware needs at least one public key"
                    )));
                }
                if algorithms.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "service '{service_id}': jwt middleware needs at least one algorithm"
                    )));
                }
            }
            MiddlewareSpec::RateLimit { capacity, rate, .. } => {
                if *capacity == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "service '{service_id}': ratelimit capacity must be >= 1"
                    )));
                }
                if !rate.is_finite() || *rate <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "service '{service_id}': ratelimit rate must be positive"
                    )));
                }
            }
            MiddlewareSpec::HeaderRewrite { .. } | MiddlewareSpec::Acl { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
listen: 127.0.0.1:8888
services:
  - id: mws
    prefix: /mws
    middlewares:
      - type: header_rewrite
        request_add: { X-TEST: test-header }
        request_remove: [Authorization]
        response_remove: [X-Upstream-Id]
      - type: acl
        allow_prefixes: [/api/user, /error]
      - type: appkey
        keys: [9cf3319cbd254202cf882a79a755ba6e]
      - type: ratelimit
        capacity: 10
        rate: 1.67
    upstreams:
      - { id: "1", url: "http://127.0.0.1:54320", weight: 1 }
    lb: random
    timeout_ms: 3000
    max_concurrent: 10
"#;

    #[test]
    fn parses_minimal_config() {
        let config = GatewayConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:8888"));
        let service = &config.services[0];
        assert_eq!(service.id, "mws");
        assert_eq!(service.middlewares.len(), 4);
        assert_eq!(service.timeout_status, 504);
        assert_eq!(service.circuit_breaker.threshold, 3);
        assert_eq!(service.retry.attempts, 1);
        match &service.middlewares[2] {
            MiddlewareSpec::AppKey { header, keys } => {
                assert_eq!(header, "X-APP-KEY");
                assert_eq!(keys.len(), 1);
            }
            other => panic!("expected appkey, got {other:?}"),
        }
        match &service.middlewares[3] {
            MiddlewareSpec::RateLimit { capacity, key, .. } => {
                assert_eq!(*capacity, 10);
                assert_eq!(*key, RateKey::PerService);
            }
            other => panic!("expected ratelimit, got {other:?}"),
        }
    }

    #[test]
    fn lb_policy_aliases_accepted() {
        for (name, expected) in [
            ("random", LbPolicy::Random),
            ("random_weighted", LbPolicy::Random),
            ("hash", LbPolicy::Hash),
            ("least_conn", LbPolicy::LeastConn),
            ("least_connection", LbPolicy::LeastConn),
            ("latency", LbPolicy::Latency),
            ("latency_weighted", LbPolicy::Latency),
        ] {
            let policy: LbPolicy = serde_yaml::from_str(name).unwrap();
            assert_eq!(policy, expected, "alias {name}");
        }
    }

    #[test]
    fn rejects_empty_upstreams() {
        let raw = r#"
services:
  - id: a
    prefix: /a
    upstreams: []
"#;
        let err = GatewayConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn rejects_duplicate_service_ids() {
        let raw = r#"
services:
  - id: a
    prefix: /a
    upstreams: [{ id: "1", url: "http://localhost:1" }]
  - id: a
    prefix: /b
    upstreams: [{ id: "1", url: "http://localhost:1" }]
"#;
        let err = GatewayConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate service id"));
    }

    #[test]
    fn rejects_bad_timeout_status() {
        let raw = r#"
services:
  - id: a
    prefix: /a
    upstreams: [{ id: "1", url: "http://localhost:1" }]
    timeout_status: 500
"#;
        let err = GatewayConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("timeout_status"));
    }

    #[test]
    fn rejects_zero_rate() {
        let raw = r#"
services:
  - id: a
    prefix: /a
    middlewares:
      - type: ratelimit
        capacity: 10
        rate: 0.0
    upstreams: [{ id: "1", url: "http://localhost:1" }]
"#;
        let err = GatewayConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("rate must be positive"));
    }
}
