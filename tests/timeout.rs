//! Upstream timeout handling and the configurable status mapping.

mod support;

use std::time::Duration;

use httpmock::prelude::*;

use support::{app_from_yaml, send};

fn slow_upstream() -> MockServer {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/timeout/slow");
        then.status(200).delay(Duration::from_millis(700));
    });
    server.mock(|when, then| {
        when.method(GET).path("/timeout/fast");
        then.status(200);
    });
    server
}

#[tokio::test]
async fn default_mapping_is_gateway_timeout() {
    let server = slow_upstream();
    let yaml = format!(
        r#"
services:
  - id: upstream
    prefix: /upstream
    upstreams:
      - {{ id: "7", url: "{}" }}
    timeout_ms: 200
"#,
        server.base_url()
    );
    let app = app_from_yaml(&yaml);

    let resp = send(&app, "GET", "/upstream/timeout/slow", &[]).await;
    assert_eq!(resp.status(), 504);
    assert_eq!(
        resp.headers().get("x-upstream-id").unwrap(),
        "7",
        "the picked upstream is named even on timeout"
    );

    let resp = send(&app, "GET", "/upstream/timeout/fast", &[]).await;
    assert_eq!(resp.status(), 200, "fast calls inside the deadline succeed");
}

#[tokio::test]
async fn legacy_mapping_returns_bad_gateway() {
    let server = slow_upstream();
    let yaml = format!(
        r#"
services:
  - id: upstream
    prefix: /upstream
    upstreams:
      - {{ id: "7", url: "{}" }}
    timeout_ms: 200
    timeout_status: 502
"#,
        server.base_url()
    );
    let app = app_from_yaml(&yaml);

    let resp = send(&app, "GET", "/upstream/timeout/slow", &[]).await;
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn timeouts_count_as_breaker_failures() {
    let server = slow_upstream();
    let yaml = format!(
        r#"
services:
  - id: upstream
    prefix: /upstream
    upstreams:
      - {{ id: "7", url: "{}" }}
    timeout_ms: 100
    circuit_breaker: {{ threshold: 2, retry_delay_sec: 60 }}
"#,
        server.base_url()
    );
    let app = app_from_yaml(&yaml);

    assert_eq!(send(&app, "GET", "/upstream/timeout/slow", &[]).await.status(), 504);
    assert_eq!(send(&app, "GET", "/upstream/timeout/slow", &[]).await.status(), 504);

    let resp = send(&app, "GET", "/upstream/timeout/slow", &[]).await;
    assert_eq!(resp.status(), 502, "breaker opened after repeated timeouts");
    assert_eq!(resp.headers().get("x-cb-state").unwrap(), "open");
}

#[tokio::test]
async fn connection_refused_maps_to_bad_gateway() {
    // Nothing listens on this port.
    let yaml = r#"
services:
  - id: upstream
    prefix: /upstream
    upstreams:
      - { id: "7", url: "http://127.0.0.1:9" }
"#;
    let app = app_from_yaml(yaml);
    let resp = send(&app, "GET", "/upstream/x", &[]).await;
    assert_eq!(resp.status(), 502);
    assert_eq!(resp.headers().get("x-upstream-id").unwrap(), "7");
}
