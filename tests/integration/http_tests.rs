//! End-to-end sessions against wiremock servers using the bundled HTTP fetcher

use crate::common::trickle_server;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tidepool::{Crawler, RequestConfig, SessionEvent, Settings, TaskOutcome, TaskSpec};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn html(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/html"),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_follow_links_across_pages() {
    let server = MockServer::start().await;
    let base = server.uri();

    html(
        &server,
        "/",
        r#"<html><head><title>Home</title></head><body>
            <a href="/page1">Page 1</a>
            <a href="/page2">Page 2</a>
            <a href="mailto:someone@example.com">Mail</a>
        </body></html>"#,
    )
    .await;
    html(&server, "/page1", "<html><head><title>Page 1</title></head></html>").await;
    html(&server, "/page2", "<html><head><title>Page 2</title></head></html>").await;

    let titles: Arc<Mutex<Vec<String>>> = Arc::default();
    let crawler = Crawler::new(Settings {
        dedup: true,
        concurrency: 2,
        ..Default::default()
    })
    .unwrap();
    {
        let titles = titles.clone();
        crawler.add_rule_fn(move |ctx| {
            if let Some(doc) = ctx.document {
                titles
                    .lock()
                    .unwrap()
                    .push(doc.title().unwrap_or_default());
                ctx.expand(doc.links());
            }
            Ok(())
        });
    }
    crawler.add_task(format!("{}/", base));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.failed, 0);
    let mut titles = titles.lock().unwrap().clone();
    titles.sort();
    assert_eq!(titles, vec!["Home", "Page 1", "Page 2"]);
}

#[tokio::test]
async fn test_http_404_completes_without_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let crawler = Crawler::new(Settings::default()).unwrap();
    crawler.add_task(format!("{}/gone", server.uri()));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_server_errors_are_retried_up_to_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let crawler = Crawler::new(Settings {
        retry_limit: 3,
        ..Default::default()
    })
    .unwrap();
    crawler.add_task(format!("{}/flaky", server.uri()));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].status, Some(503));
    assert_eq!(report.failures[0].attempts, 3);
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    let crawler = Crawler::new(Settings {
        retry_limit: 2,
        ..Default::default()
    })
    .unwrap();
    // Nothing listens on port 1
    crawler.add_task("http://127.0.0.1:1/");

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 2);
    assert_eq!(report.failures[0].status, None);
}

#[tokio::test]
async fn test_download_writes_file() {
    let server = MockServer::start().await;
    let image = vec![0x89, b'P', b'N', b'G', 1, 2, 3, 4];
    Mock::given(method("GET"))
        .and(path("/img/cat.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image.clone()))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let outcomes: Arc<Mutex<Vec<TaskOutcome>>> = Arc::default();
    let crawler = Crawler::new(Settings {
        download_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    {
        let outcomes = outcomes.clone();
        crawler.add_rule_fn(move |ctx| {
            assert!(ctx.document.is_none());
            outcomes.lock().unwrap().push(ctx.result.outcome.clone());
            Ok(())
        });
    }
    crawler
        .add_task(TaskSpec::download(format!("{}/img/cat.png", server.uri())))
        .add_task(
            TaskSpec::download(format!("{}/img/cat.png", server.uri())).target("album/nested/1.png"),
        );

    let report = crawler.start().await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(std::fs::read(dir.path().join("cat.png")).unwrap(), image);
    assert_eq!(
        std::fs::read(dir.path().join("album/nested/1.png")).unwrap(),
        image
    );
    assert!(outcomes
        .lock()
        .unwrap()
        .iter()
        .all(|o| matches!(o, TaskOutcome::Downloaded { .. })));
}

#[tokio::test]
async fn test_download_longer_than_timeout_completes() {
    // Five pieces 60ms apart: about 300ms in total, each wait well under 200ms
    let base = trickle_server(vec![b"abcd".as_slice(); 5], 20, Duration::from_millis(60)).await;
    let dir = tempdir().unwrap();

    let crawler = Crawler::new(Settings {
        download_dir: dir.path().to_path_buf(),
        retry_limit: 1,
        request: RequestConfig {
            timeout: Some(200),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    crawler.add_task(TaskSpec::download(format!("{}/files/big.bin", base)));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        std::fs::read(dir.path().join("big.bin")).unwrap(),
        b"abcd".repeat(5)
    );
    assert!(!dir.path().join("big.bin.part").exists());
}

#[tokio::test]
async fn test_interrupted_download_leaves_no_file() {
    // Announces 100 bytes, sends 4, then closes the connection
    let base = trickle_server(vec![b"abcd".as_slice()], 100, Duration::ZERO).await;
    let dir = tempdir().unwrap();

    let crawler = Crawler::new(Settings {
        download_dir: dir.path().to_path_buf(),
        retry_limit: 2,
        ..Default::default()
    })
    .unwrap();
    crawler.add_task(TaskSpec::download(format!("{}/files/cut.bin", base)));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 2);
    assert!(!dir.path().join("cut.bin").exists());
    assert!(!dir.path().join("cut.bin.part").exists());
}

#[tokio::test]
async fn test_unwritable_download_dir_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
        .expect(1)
        .mount(&server)
        .await;

    // A regular file where a directory is needed
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::default();

    let crawler = Crawler::new(Settings {
        download_dir: blocker.path().to_path_buf(),
        retry_limit: 3,
        ..Default::default()
    })
    .unwrap();
    {
        let events = events.clone();
        crawler.on_event(move |_: &Crawler, event: &SessionEvent| {
            events.lock().unwrap().push(event.clone());
        });
    }
    crawler.add_task(
        TaskSpec::download(format!("{}/file.bin", server.uri())).target("sub/file.bin"),
    );

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::TaskFailed(_))));
}

#[tokio::test]
async fn test_request_config_is_layered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("user-agent", "tidepool-test"))
        .and(header("x-session", "defaults"))
        .and(header("x-task", "override"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let mut session_request = RequestConfig {
        user_agent: Some("tidepool-test".to_string()),
        ..Default::default()
    };
    session_request
        .headers
        .insert("x-session".to_string(), "defaults".to_string());

    let mut task_request = RequestConfig::default();
    task_request
        .headers
        .insert("x-task".to_string(), "override".to_string());

    let crawler = Crawler::new(Settings {
        request: session_request,
        retry_limit: 1,
        ..Default::default()
    })
    .unwrap();
    crawler.add_task(TaskSpec::page(format!("{}/secure", server.uri())).request(task_request));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
}
