//! HTTP adapter behavior against a mock server.

use std::time::Duration;

use qem_core::gateway::{CloudImageSource, DashboardGateway, RepoMetadataSource, RepoReply};
use qem_core::{FetchError, RetryPolicy};
use qem_http::{HttpClient, HttpConfig};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, attempts: u32) -> HttpClient {
    HttpClient::new(HttpConfig {
        dashboard_url: format!("{}/", server.uri()),
        token: Some("secret".to_string()),
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 1.0,
            max_backoff: Duration::from_millis(1),
        },
    })
    .unwrap()
}

#[tokio::test]
async fn repo_metadata_found_and_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<repomd/>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, 3);
    let found = client
        .fetch(&format!("{}/repo/repodata/repomd.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(found, RepoReply::Found(b"<repomd/>".to_vec()));

    let missing = client
        .fetch(&format!("{}/gone/repodata/repomd.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(missing, RepoReply::Missing { status: 404 });
}

#[tokio::test]
async fn repo_metadata_server_error_is_retried_then_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let reply = client(&server, 2)
        .fetch(&format!("{}/flaky/repodata/repomd.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(reply, RepoReply::Missing { status: 503 });
}

#[tokio::test]
async fn scheduled_jobs_retry_and_send_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/incident_settings/42"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/incident_settings/42"))
        .and(header("Authorization", "Token secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"flavor": "Server-DVD-Incidents", "arch": "x86_64", "settings": {"REPOHASH": 7}}
        ])))
        .mount(&server)
        .await;

    let jobs = client(&server, 3).scheduled_jobs(42).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].flavor, "Server-DVD-Incidents");
    assert_eq!(jobs[0].repohash.as_deref(), Some("7"));
}

#[tokio::test]
async fn scheduled_jobs_error_object_means_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/incident_settings/9"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "not found"})))
        .mount(&server)
        .await;

    let jobs = client(&server, 1).scheduled_jobs(9).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn incidents_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/incidents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "number": 24618,
            "project": "SUSE:Maintenance:24618",
            "rr_number": 274060,
            "inReview": true,
            "packages": ["kernel-default"],
            "channels": ["SUSE:Updates:SLE-Module-Basesystem:15-SP4:x86_64"]
        }])))
        .mount(&server)
        .await;

    let incidents = client(&server, 1).incidents().await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].number, 24618);
    assert!(incidents[0].in_review);
    assert!(!incidents[0].embargoed);
}

#[tokio::test]
async fn incidents_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/incidents"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = client(&server, 3).incidents().await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 403, .. }));
}

#[tokio::test]
async fn cloud_catalog_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"images": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = client(&server, 1);
    let value = client
        .get_json(&format!("{}/images.json", server.uri()))
        .await
        .unwrap();
    assert_eq!(value, json!({"images": []}));

    let err = client
        .get_json(&format!("{}/bad.json", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));
}
