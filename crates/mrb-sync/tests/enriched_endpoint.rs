use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use mrb_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use mrb_sync::{DeliveryError, DeliveryStrategy, EnrichedEndpoint, ProxyRoute};
use serde_json::json;

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("http client"),
    )
}

#[tokio::test]
async fn direct_endpoint_unwraps_data_envelope() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/enriched");
            then.status(200).json_body(json!({
                "data": [
                    { "id": 7, "statusName": "In Progress", "moveIn": "Feb 23" },
                    "not-a-record"
                ]
            }));
        })
        .await;

    let endpoint = EnrichedEndpoint::direct(fetcher(), server.url("/enriched"), Duration::from_secs(5));
    let records = endpoint.deliver().await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["moveIn"], json!("Feb 23"));
}

#[tokio::test]
async fn error_envelope_is_an_upstream_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/enriched");
            then.status(200)
                .json_body(json!({ "error": "token expired" }));
        })
        .await;

    let endpoint = EnrichedEndpoint::direct(fetcher(), server.url("/enriched"), Duration::from_secs(5));
    let err = endpoint.deliver().await.unwrap_err();
    assert!(matches!(&err, DeliveryError::Upstream(msg) if msg.contains("token expired")), "{err}");
}

#[tokio::test]
async fn server_errors_are_transient_and_html_is_malformed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/down");
            then.status(503);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/html");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html>maintenance</html>");
        })
        .await;

    let down = EnrichedEndpoint::direct(fetcher(), server.url("/down"), Duration::from_secs(5));
    assert!(matches!(down.deliver().await, Err(DeliveryError::Transient(_))));

    let html = EnrichedEndpoint::direct(fetcher(), server.url("/html"), Duration::from_secs(5));
    assert!(matches!(html.deliver().await, Err(DeliveryError::UpstreamShape(_))));
}

#[tokio::test]
async fn proxied_endpoint_passes_target_as_query_parameter() {
    let server = MockServer::start_async().await;
    let target = "https://api.example/enriched?scope=make-ready";
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/proxy").query_param("target", target);
            then.status(200).json_body(json!([{ "id": 1 }]));
        })
        .await;

    let route = ProxyRoute {
        base: server.url("/proxy"),
        param: "target".to_string(),
    };
    let endpoint = EnrichedEndpoint::proxied(fetcher(), &route, target, Duration::from_secs(5))
        .expect("proxy route");
    assert!(endpoint.name().contains("via"));
    let records = endpoint.deliver().await.expect("records");
    assert_eq!(records.len(), 1);
    mock.assert_async().await;
}
