use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::balance;
use crate::config::LbPolicy;
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::RequestCtx;
use crate::state::{AppState, ServiceEntry, UpstreamEntry};

/// Forward one admitted request to an upstream: LB pick, breaker admission,
/// concurrency gate, timed outbound call, stats bookkeeping.
///
/// Breaker admission happens before the concurrency gate so an OPEN breaker
/// short-circuits without consuming a slot. The semaphore permit and the
/// inflight guard are both RAII, so every exit path (including the caller
/// being cancelled on client disconnect) releases them; breaker and EWMA
/// records only happen on completed calls.
pub async fn dispatch_upstream(
    state: &AppState,
    service: &Arc<ServiceEntry>,
    ctx: &RequestCtx,
) -> GatewayResult<Response> {
    let lb_key = hash_key(ctx);

    let mut index = pick_admitted(state, service, &lb_key)?;

    let _permit = service
        .limiter
        .clone()
        .try_acquire_owned()
        .map_err(|_| GatewayError::ConcurrencyReject)?;

    let mut attempt = 0;
    loop {
        let upstream = &service.upstreams[index];
        match call_once(state, service, upstream, ctx).await {
            Ok(response) => return Ok(response),
            // Only transport-level failures are retried; a fresh LB pick
            // re-runs breaker admission for the replacement.
            Err(GatewayError::UpstreamTransport { upstream_id, reason })
                if attempt + 1 < service.retry_attempts =>
            {
                attempt += 1;
                warn!(
                    service = %service.id,
                    upstream = %upstream_id,
                    %reason,
                    attempt,
                    "retrying after transport error"
                );
                index = pick_admitted(state, service, &lb_key)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The hash policy's stickiness input: `X-LB-HASH`, else the client IP.
fn hash_key(ctx: &RequestCtx) -> String {
    ctx.headers
        .get("x-lb-hash")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| ctx.client_ip.map(|ip| ip.to_string()))
        .unwrap_or_default()
}

/// Pick an upstream whose breaker admits the call. Only the hash policy fails
/// over to a sibling; the others surface the open breaker as a 502.
fn pick_admitted(
    state: &AppState,
    service: &ServiceEntry,
    lb_key: &str,
) -> GatewayResult<usize> {
    let index = balance::pick(service.lb, &service.upstreams, lb_key);
    if admit(state, service, &service.upstreams[index]) {
        return Ok(index);
    }

    if service.lb == LbPolicy::Hash {
        let mut candidates: Vec<usize> = (0..service.upstreams.len())
            .filter(|candidate| *candidate != index)
            .collect();
        candidates.sort_by(|a, b| service.upstreams[*a].id.cmp(&service.upstreams[*b].id));
        for candidate in candidates {
            if admit(state, service, &service.upstreams[candidate]) {
                debug!(
                    service = %service.id,
                    from = %service.upstreams[index].id,
                    to = %service.upstreams[candidate].id,
                    "hash pick failed over around open breaker"
                );
                return Ok(candidate);
            }
        }
    }

    Err(GatewayError::BreakerOpen {
        upstream_id: service.upstreams[index].id.clone(),
    })
}

fn admit(state: &AppState, service: &ServiceEntry, upstream: &UpstreamEntry) -> bool {
    let mut breaker = upstream.breaker.lock().expect("breaker lock poisoned");
    let before = breaker.state_label();
    let admitted = breaker.admit();
    let after = breaker.state_label();
    if before != after {
        state
            .metrics
            .record_breaker_transition(&service.id, &upstream.id, after);
        debug!(service = %service.id, upstream = %upstream.id, state = after, "breaker transition");
    }
    admitted
}

async fn call_once(
    state: &AppState,
    service: &ServiceEntry,
    upstream: &Arc<UpstreamEntry>,
    ctx: &RequestCtx,
) -> GatewayResult<Response> {
    let _inflight = upstream.begin_inflight();
    let started = Instant::now();
    let outcome = tokio::time::timeout(service.timeout, forward(state, upstream, ctx)).await;

    match outcome {
        Err(_elapsed) => {
            record_failure(state, service, upstream, service.timeout.as_secs_f64() * 1000.0);
            warn!(service = %service.id, upstream = %upstream.id, "upstream call timed out");
            Err(GatewayError::UpstreamTimeout {
                upstream_id: upstream.id.clone(),
                mapped_status: service.timeout_status,
            })
        }
        Ok(Err(err)) => {
            record_failure(state, service, upstream, service.timeout.as_secs_f64() * 1000.0);
            Err(GatewayError::UpstreamTransport {
                upstream_id: upstream.id.clone(),
                reason: err.to_string(),
            })
        }
        Ok(Ok((status, headers, body))) => {
            let elapsed = started.elapsed();
            state.metrics.observe_upstream_latency(
                &service.id,
                &upstream.id,
                elapsed.as_secs_f64(),
            );
            if status.as_u16() >= 500 {
                // Every failure contributes the timeout value, not its real
                // latency, so chronically failing upstreams are avoided by
                // the latency-weighted policy.
                record_failure(state, service, upstream, service.timeout.as_secs_f64() * 1000.0);
            } else {
                upstream.record_latency(elapsed.as_secs_f64() * 1000.0);
                let mut breaker = upstream.breaker.lock().expect("breaker lock poisoned");
                let before = breaker.state_label();
                breaker.record_success();
                if before != breaker.state_label() {
                    state.metrics.record_breaker_transition(
                        &service.id,
                        &upstream.id,
                        breaker.state_label(),
                    );
                    debug!(service = %service.id, upstream = %upstream.id, "breaker closed");
                }
            }
            Ok(assemble_response(status, headers, body, &upstream.id))
        }
    }
}

fn record_failure(
    state: &AppState,
    service: &ServiceEntry,
    upstream: &UpstreamEntry,
    sample_ms: f64,
) {
    upstream.record_latency(sample_ms);
    let mut breaker = upstream.breaker.lock().expect("breaker lock poisoned");
    let before = breaker.state_label();
    breaker.record_failure();
    let after = breaker.state_label();
    if before != after {
        state
            .metrics
            .record_breaker_transition(&service.id, &upstream.id, after);
        warn!(service = %service.id, upstream = %upstream.id, state = after, "breaker transition");
    }
}

async fn forward(
    state: &AppState,
    upstream: &UpstreamEntry,
    ctx: &RequestCtx,
) -> Result<(StatusCode, HeaderMap, Bytes), reqwest::Error> {
    let mut url = format!("{}{}", upstream.base_url, ctx.rel_path);
    if let Some(query) = &ctx.query {
        url.push('?');
        url.push_str(query);
    }

    let mut request = state.http_client.request(ctx.method.clone(), &url);
    for (name, value) in ctx.headers.iter() {
        if is_hop_by_hop(name.as_str())
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        request = request.header(name, value);
    }

    let response = request.body(ctx.body.clone()).send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok((status, headers, body))
}

fn assemble_response(
    status: StatusCode,
    upstream_headers: HeaderMap,
    body: Bytes,
    upstream_id: &str,
) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name.as_str()) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(upstream_id) {
        headers.insert("X-Upstream-Id", value);
    }
    response
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
