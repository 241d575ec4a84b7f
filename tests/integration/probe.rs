//! Probe executor against local HTTP endpoints

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use sitewatch::{ProbeErrorCode, probe::ProbeExecutor, target::Credentials};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_probe_success_records_response() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("all systems nominal")
                .insert_header("content-type", "text/plain"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let target = create_test_target("health", &format!("{}/health", mock_server.uri()));

    let observation = executor.probe(&target).await;

    assert!(observation.success);
    assert_eq!(observation.http_code, 200);
    assert_eq!(observation.size_download, 19);
    assert_eq!(observation.site_name, "health");
    assert_eq!(observation.primary_ip, "127.0.0.1");
    assert_eq!(observation.content_type, "text/plain");
    assert_eq!(observation.redirect_count, 0);
    assert_eq!(observation.error_code, None);
    assert_eq!(observation.error, None);
    assert!(observation.response_time > 0.0);
    assert!(observation.response_time >= observation.starttransfer_time);
    assert_eq!(
        observation.content_hash,
        Some(hex::encode(Sha256::digest(b"all systems nominal")))
    );
}

#[tokio::test]
async fn test_probe_status_mismatch_is_unsuccessful_response() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let target = create_test_target("down", &mock_server.uri());

    let observation = executor.probe(&target).await;

    assert!(!observation.success);
    assert!(observation.responded());
    assert_eq!(observation.http_code, 503);
    assert_eq!(observation.size_download, 11);
    assert_eq!(observation.error.as_deref(), Some("expected HTTP 200, got 503"));
}

#[tokio::test]
async fn test_probe_expected_status_other_than_200() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let mut target = create_test_target("empty", &mock_server.uri());
    target.expected_status = 204;

    let observation = executor.probe(&target).await;

    assert!(observation.success);
    assert_eq!(observation.http_code, 204);
    assert_eq!(observation.size_download, 0);
}

#[tokio::test]
async fn test_probe_timeout() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(1));
    let target = create_test_target("slow", &mock_server.uri());

    let observation = executor.probe(&target).await;

    assert!(!observation.success);
    assert_eq!(observation.http_code, 0);
    assert_eq!(observation.error_code, Some(ProbeErrorCode::Timeout));
    assert!(observation.response_time >= 900.0);
}

#[tokio::test]
async fn test_probe_unresolvable_host() {
    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let target = create_test_target("nowhere", "http://does-not-exist.invalid/");

    let observation = executor.probe(&target).await;

    assert!(!observation.success);
    assert_eq!(observation.error_code, Some(ProbeErrorCode::Dns));
    assert!(observation.error.is_some());
}

#[tokio::test]
async fn test_probe_content_check() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Welcome</h1>"))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));

    let mut found = create_test_target("found", &mock_server.uri());
    found.content_check = Some("Welcome".to_string());
    let mut missing = create_test_target("missing", &mock_server.uri());
    missing.content_check = Some("Goodbye".to_string());
    let unchecked = create_test_target("unchecked", &mock_server.uri());

    let observations = executor.probe_all(&[found, missing, unchecked]).await;

    assert_eq!(observations[0].content_check, Some(true));
    assert_eq!(observations[1].content_check, Some(false));
    assert_eq!(observations[2].content_check, None);
    // the content check does not decide success
    assert!(observations.iter().all(|observation| observation.success));
}

#[tokio::test]
async fn test_probe_follows_redirects() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("location", format!("{}/new", mock_server.uri())),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved here"))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let target = create_test_target("moved", &format!("{}/old", mock_server.uri()));

    let observation = executor.probe(&target).await;

    assert!(observation.success);
    assert_eq!(observation.redirect_count, 1);
    assert_eq!(observation.url, format!("{}/new", mock_server.uri()));
}

#[tokio::test]
async fn test_probe_redirect_limit() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", format!("{}/loop", mock_server.uri())),
        )
        .mount(&mock_server)
        .await;

    let mut settings = create_test_probe_config(5);
    settings.max_redirects = 3;
    let executor = ProbeExecutor::new(settings);
    let target = create_test_target("loop", &format!("{}/loop", mock_server.uri()));

    let observation = executor.probe(&target).await;

    assert!(!observation.success);
    assert_eq!(observation.error_code, Some(ProbeErrorCode::Redirect));
}

#[tokio::test]
async fn test_probe_sends_basic_auth() {
    let mock_server = MockServer::start().await;
    // "admin:secret"
    Mock::given(method("GET"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let mut target = create_test_target("private", &mock_server.uri());
    target.auth = Some(Credentials {
        username: "admin".to_string(),
        password: Some("secret".to_string()),
    });

    let observation = executor.probe(&target).await;

    assert_eq!(observation.http_code, 200);
    assert!(observation.success);
}

#[tokio::test]
async fn test_probe_sends_user_agent() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("user-agent", "sitewatch-test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut settings = create_test_probe_config(5);
    settings.user_agent = "sitewatch-test".to_string();
    let executor = ProbeExecutor::new(settings);
    let target = create_test_target("ua", &mock_server.uri());

    assert!(executor.probe(&target).await.success);
}

#[tokio::test]
async fn test_probe_ip_override_keeps_host() {
    let mock_server = MockServer::start().await;
    let port = mock_server.address().port();
    Mock::given(method("GET"))
        .and(header("host", format!("sitewatch.test:{port}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("pinned"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let mut target = create_test_target("pinned", &format!("http://sitewatch.test:{port}/"));
    target.ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let observation = executor.probe(&target).await;

    assert!(observation.success);
    assert_eq!(observation.primary_ip, "127.0.0.1");
    assert_eq!(observation.namelookup_time, 0.0);
}

#[tokio::test]
async fn test_probe_all_preserves_order() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(5));
    let targets = vec![
        create_test_target("first", &format!("{}/slow", mock_server.uri())),
        create_test_target("second", &format!("{}/fast", mock_server.uri())),
        create_test_target("third", &format!("http://127.0.0.1:{}/", closed_port())),
    ];

    let observations = executor.probe_all(&targets).await;

    let names: Vec<_> = observations.iter().map(|o| o.site_name.as_str()).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    assert!(observations[0].success);
    assert!(observations[1].success);
    assert_eq!(observations[2].error_code, Some(ProbeErrorCode::Connect));
}

#[tokio::test]
async fn test_probe_all_with_concurrency_limit() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&mock_server)
        .await;

    let mut settings = create_test_probe_config(5);
    settings.concurrency = Some(2);
    let executor = ProbeExecutor::new(settings);
    let targets: Vec<_> = (0..5)
        .map(|i| create_test_target(&format!("site-{i}"), &format!("{}/{i}", mock_server.uri())))
        .collect();

    let observations = executor.probe_all(&targets).await;

    assert_eq!(observations.len(), 5);
    assert!(observations.iter().all(|observation| observation.success));
}

#[tokio::test]
async fn test_run_deadline_cancels_outstanding_probes() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let executor = ProbeExecutor::new(create_test_probe_config(30));
    let targets = vec![
        create_test_target("slow", &format!("{}/slow", mock_server.uri())),
        create_test_target("fast", &format!("{}/fast", mock_server.uri())),
    ];

    let started = std::time::Instant::now();
    let observations = executor
        .probe_all_within(&targets, Duration::from_millis(500))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(observations[0].error_code, Some(ProbeErrorCode::Cancelled));
    assert_eq!(observations[0].site_name, "slow");
    assert!(!observations[0].success);
    assert!(observations[1].success);
}
