use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use tokio::sync::Semaphore;

use crate::breaker::CircuitBreaker;
use crate::config::{GatewayConfig, LbPolicy, ServiceConfig, UpstreamConfig};
use crate::error::ConfigError;
use crate::metrics::GatewayMetrics;
use crate::middleware::{self, Middleware};

/// Weight given to the newest latency sample in the EWMA.
const EWMA_ALPHA: f64 = 0.2;

/// One backend instance behind a service, together with all of its mutable
/// per-process state: circuit breaker, live inflight count, latency EWMA.
/// Entries live in the service's upstream arena and are addressed by index.
pub struct UpstreamEntry {
    pub id: String,
    pub base_url: String,
    pub weight: u32,
    pub breaker: Mutex<CircuitBreaker>,
    inflight: AtomicUsize,
    ewma_ms: Mutex<f64>,
}

impl UpstreamEntry {
    fn from_config(config: &UpstreamConfig, breaker: CircuitBreaker) -> Self {
        Self {
            id: config.id.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            weight: config.weight,
            breaker: Mutex::new(breaker),
            inflight: AtomicUsize::new(0),
            ewma_ms: Mutex::new(0.0),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Count an outbound call as started; the guard decrements on drop, so
    /// cancelled and failed calls release the slot like completed ones.
    pub fn begin_inflight(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            upstream: Arc::clone(self),
        }
    }

    /// Smoothed latency in milliseconds; 0.0 until the first sample lands.
    pub fn ewma_ms(&self) -> f64 {
        *self.ewma_ms.lock().expect("ewma lock poisoned")
    }

    pub fn record_latency(&self, sample_ms: f64) {
        let mut ewma = self.ewma_ms.lock().expect("ewma lock poisoned");
        *ewma = if *ewma <= 0.0 {
            sample_ms
        } else {
            EWMA_ALPHA * sample_ms + (1.0 - EWMA_ALPHA) * *ewma
        };
    }
}

pub struct InflightGuard {
    upstream: Arc<UpstreamEntry>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.upstream.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A routing target: compiled middleware chain, upstream arena, and the
/// policies applied around the outbound call. Immutable after startup except
/// for the registries inside.
pub struct ServiceEntry {
    pub id: String,
    pub prefix: String,
    pub middlewares: Vec<Box<dyn Middleware>>,
    pub upstreams: Vec<Arc<UpstreamEntry>>,
    pub lb: LbPolicy,
    pub timeout: Duration,
    pub timeout_status: StatusCode,
    pub retry_attempts: u32,
    pub limiter: Arc<Semaphore>,
}

impl ServiceEntry {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        let middlewares = config
            .middlewares
            .iter()
            .map(|spec| middleware::build(spec, &config.id))
            .collect::<Result<Vec<_>, _>>()?;

        let retry_delay = Duration::from_secs_f64(config.circuit_breaker.retry_delay_sec);
        let upstreams = config
            .upstreams
            .iter()
            .map(|upstream| {
                Arc::new(UpstreamEntry::from_config(
                    upstream,
                    CircuitBreaker::new(config.circuit_breaker.threshold, retry_delay),
                ))
            })
            .collect();

        let timeout_status = StatusCode::from_u16(config.timeout_status)
            .map_err(|_| ConfigError::Invalid("timeout_status out of range".into()))?;

        Ok(Self {
            id: config.id.clone(),
            prefix: config.prefix.clone(),
            middlewares,
            upstreams,
            lb: config.lb,
            timeout: Duration::from_millis(config.timeout_ms),
            timeout_status,
            retry_attempts: config.retry.attempts,
            limiter: Arc::new(Semaphore::new(config.max_concurrent)),
        })
    }

    /// Whether `path` belongs to this service. Prefixes bind on path-segment
    /// boundaries: `/mws` owns `/mws` and `/mws/...` but not `/mwsx`.
    pub fn owns_path(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Service-relative path with the prefix stripped, normalized to start
    /// with '/'.
    pub fn rel_path<'a>(&self, path: &'a str) -> &'a str {
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        if rest.is_empty() {
            "/"
        } else {
            rest
        }
    }
}

/// Shared handle cloned into every request task. The service table is
/// immutable; all mutable state hangs off the entries inside it.
#[derive(Clone)]
pub struct AppState {
    services: Arc<Vec<Arc<ServiceEntry>>>,
    pub http_client: reqwest::Client,
    pub metrics: Arc<GatewayMetrics>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        http_client: reqwest::Client,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ConfigError> {
        let mut services = config
            .services
            .iter()
            .map(|service| ServiceEntry::from_config(service).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        // Longest prefix first, so the first owning service wins the lookup.
        services.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            services: Arc::new(services),
            http_client,
            metrics,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn find_service(&self, path: &str) -> Option<&Arc<ServiceEntry>> {
        self.services.iter().find(|service| service.owns_path(path))
    }

    pub fn services(&self) -> &[Arc<ServiceEntry>] {
        &self.services
    }
}
