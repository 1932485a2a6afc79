use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Process-wide counters, exposed in Prometheus text format at the reserved
/// `/metrics` path.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    rate_limit_rejections: IntCounterVec,
    breaker_transitions: IntCounterVec,
    upstream_latency: HistogramVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Requests handled, by service and outcome",
            ),
            &["service", "outcome"],
        )?;
        let rate_limit_rejections = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Requests rejected by the token bucket",
            ),
            &["service"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "gateway_breaker_transitions_total",
                "Circuit breaker state entries, by upstream and new state",
            ),
            &["service", "upstream", "state"],
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_latency_seconds",
                "Time spent waiting on upstream responses",
            ),
            &["service", "upstream"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        Ok(Self {
            registry,
            requests,
            rate_limit_rejections,
            breaker_transitions,
            upstream_latency,
        })
    }

    pub fn record_request(&self, service: &str, outcome: &str) {
        self.requests.with_label_values(&[service, outcome]).inc();
        if outcome == "rate_limited" {
            self.rate_limit_rejections
                .with_label_values(&[service])
                .inc();
        }
    }

    pub fn record_breaker_transition(&self, service: &str, upstream: &str, state: &str) {
        self.breaker_transitions
            .with_label_values(&[service, upstream, state])
            .inc();
    }

    pub fn observe_upstream_latency(&self, service: &str, upstream: &str, secs: f64) {
        self.upstream_latency
            .with_label_values(&[service, upstream])
            .observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_counters() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("mws", "ok");
        metrics.record_request("mws", "rate_limited");
        let families = metrics.registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"gateway_requests_total"));
        assert!(names.contains(&"gateway_rate_limit_rejections_total"));
    }
}
