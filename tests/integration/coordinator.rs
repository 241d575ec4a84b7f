//! Full collection passes: lock, probe, store, detect, notify, maintain

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{Days, Local, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use sitewatch::{
    AnomalyKind, Coordinator, RunOutcome, RunState, Severity,
    error::{ConfigError, RunError},
    lock::LockRecord,
    storage::{FileStore, TimeSeriesStore},
};
use tempfile::tempdir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn completed(outcome: RunOutcome) -> sitewatch::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_stores_observations() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "Home Page", "url": mock_server.uri() })],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let notifier = RecordingNotifier::default();
    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(notifier.clone()));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(summary.targets, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(summary.storage_errors, 0);
    assert_eq!(summary.anomalies, 0);
    assert!(!summary.reclaimed_stale_lock);
    assert!(notifier.reports().is_empty());

    assert_eq!(store.list_targets().await.unwrap(), vec!["home_page".to_string()]);
    let history = store.history("Home Page", 1).await.unwrap();
    let observations: Vec<_> = history.values().flatten().collect();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].http_code, 200);
    assert_eq!(observations[0].size_download, 5);

    assert!(!config.lock.path.exists());
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_unreachable_target_is_stored_and_reported() {
    let dir = tempdir().unwrap();
    let url = format!("http://127.0.0.1:{}/", closed_port());
    let config = create_test_config(dir.path(), vec![json!({ "name": "gone", "url": url })]);
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let notifier = RecordingNotifier::default();
    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(notifier.clone()));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(summary.anomalies, 1);
    assert_eq!(summary.reports, 1);

    let reports = notifier.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].target.name, "gone");
    assert_eq!(reports[0].anomalies.len(), 1);
    assert_eq!(reports[0].anomalies[0].kind, AnomalyKind::Unreachable);
    assert_eq!(reports[0].anomalies[0].severity, Severity::Critical);

    let stats = store.stats("gone", 1).await.unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.successful, 0);
}

#[tokio::test]
async fn test_status_and_baseline_anomalies() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("x".repeat(100))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "shop", "url": mock_server.uri() })],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());

    // ten fast 1000-byte responses form the baseline
    let target = config.targets().unwrap().remove(0);
    for i in 0..10 {
        let timestamp = Utc::now() - chrono::Duration::seconds(60 * (i + 1));
        let observation = create_test_observation(&target, timestamp, 200, 20.0, 1000);
        store.append(&observation).await.unwrap();
    }

    let notifier = RecordingNotifier::default();
    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(notifier.clone()));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(summary.reports, 1);
    let reports = notifier.reports();
    let kinds: Vec<_> = reports[0].anomalies.iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![AnomalyKind::SlowResponse, AnomalyKind::SizeDeviation]);
    assert_eq!(reports[0].severity(), Some(Severity::Warning));
}

#[tokio::test]
async fn test_server_error_is_critical_status_mismatch() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "api", "url": mock_server.uri() })],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let notifier = RecordingNotifier::default();
    let coordinator = Coordinator::new(&config, store, Arc::new(notifier.clone()));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(summary.failed, 1);
    let reports = notifier.reports();
    assert_eq!(reports[0].anomalies.len(), 1);
    assert_eq!(reports[0].anomalies[0].kind, AnomalyKind::StatusMismatch);
    assert_eq!(reports[0].anomalies[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_held_lock_skips_run() {
    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "a", "url": "http://127.0.0.1:1/" })],
    );
    let holder = LockRecord {
        pid: 4242,
        timestamp: Utc::now().timestamp(),
        started_at: Utc::now().to_rfc3339(),
    };
    fs::write(&config.lock.path, serde_json::to_vec(&holder).unwrap()).unwrap();

    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let notifier = RecordingNotifier::default();
    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(notifier.clone()));

    let loaded = AtomicBool::new(false);
    let outcome = coordinator
        .run(|| {
            loaded.store(true, Ordering::SeqCst);
            config.targets()
        })
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::LockHeld { pid: 4242, .. });
    assert_eq!(outcome.exit_code(), 2);
    assert!(!loaded.load(Ordering::SeqCst));
    assert!(!config.data_dir.exists());
    assert!(store.list_targets().await.unwrap().is_empty());
    assert!(notifier.reports().is_empty());

    // the foreign lock stays in place
    let record: LockRecord = serde_json::from_slice(&fs::read(&config.lock.path).unwrap()).unwrap();
    assert_eq!(record, holder);
}

#[tokio::test]
async fn test_stale_lock_is_reclaimed() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "a", "url": mock_server.uri() })],
    );
    let stale = LockRecord {
        pid: 4242,
        timestamp: Utc::now().timestamp() - 3600,
        started_at: "an hour ago".to_string(),
    };
    fs::write(&config.lock.path, serde_json::to_vec(&stale).unwrap()).unwrap();

    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let coordinator = Coordinator::new(&config, store, Arc::new(RecordingNotifier::default()));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert!(summary.reclaimed_stale_lock);
    assert_eq!(summary.stored, 1);
    assert!(!config.lock.path.exists());
}

#[tokio::test]
async fn test_config_error_releases_lock() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path(), vec![]);
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let coordinator = Coordinator::new(&config, store, Arc::new(RecordingNotifier::default()));

    let result = coordinator.run(|| config.targets()).await;

    let error = result.unwrap_err();
    assert_matches!(error, RunError::Config(ConfigError::NoTargets));
    assert_eq!(error.exit_code(), 1);
    assert!(!config.lock.path.exists());
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_consecutive_runs() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "a", "url": mock_server.uri() })],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(RecordingNotifier::default()));

    completed(coordinator.run(|| config.targets()).await.unwrap());
    completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(store.stats("a", 1).await.unwrap().count, 2);
}

#[tokio::test]
async fn test_notifier_failure_does_not_abort_run() {
    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![
            json!({ "name": "first", "url": format!("http://127.0.0.1:{}/", closed_port()) }),
            json!({ "name": "second", "url": format!("http://127.0.0.1:{}/", closed_port()) }),
        ],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());
    let coordinator = Coordinator::new(&config, store, Arc::new(FailingNotifier));

    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    assert_eq!(summary.stored, 2);
    assert_eq!(summary.reports, 2);
    assert_eq!(summary.notify_errors, 2);
}

#[tokio::test]
async fn test_maintenance_compresses_and_expires() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let dir = tempdir().unwrap();
    let config = create_test_config(
        dir.path(),
        vec![json!({ "name": "a", "url": mock_server.uri() })],
    );
    let store = Arc::new(FileStore::new(&config.data_dir).await.unwrap());

    let target = config.targets().unwrap().remove(0);
    let today = Local::now().date_naive();
    for age in [10u64, 120] {
        let day = today - Days::new(age);
        let timestamp = day
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_local_timezone(Local)
            .unwrap()
            .with_timezone(&Utc);
        store
            .append(&create_test_observation(&target, timestamp, 200, 50.0, 10))
            .await
            .unwrap();
    }

    let coordinator = Coordinator::new(&config, store.clone(), Arc::new(RecordingNotifier::default()));
    let summary = completed(coordinator.run(|| config.targets()).await.unwrap());

    // day 10 is past the 7-day compression threshold, day 120 past the 90-day retention
    assert_eq!(summary.compressed, 2);
    assert_eq!(summary.deleted, 1);

    let namespace = config.data_dir.join("a");
    let ten_days_ago = (today - Days::new(10)).format("%Y-%m-%d");
    assert!(namespace.join(format!("{ten_days_ago}.json.gz")).exists());
    assert!(!namespace.join(format!("{ten_days_ago}.json")).exists());
    assert_eq!(store.stats("a", 30).await.unwrap().count, 2);
}
