//! Scheduler and lifecycle behaviour against an in-memory fetcher

use crate::common::{urls, MockFetcher, Recorder};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidepool::{
    Crawler, FetchError, FetchResponse, Interval, RequestConfig, RunState, SessionEvent, Settings,
    TaskOutcome, TaskResult, TaskSpec,
};

fn crawler(settings: Settings, fetcher: MockFetcher) -> Crawler {
    Crawler::builder()
        .settings(settings)
        .fetcher(fetcher)
        .build()
        .expect("valid settings")
}

#[tokio::test]
async fn test_four_tasks_with_interval() {
    let fetcher = MockFetcher::ok();
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            interval: Interval::fixed(Duration::from_millis(30)),
            ..Default::default()
        },
        fetcher,
    );
    crawler
        .add_tasks(urls("https://example.com", 4))
        .add_rule_fn(|_| Ok(()));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.completed(), 4);
    assert_eq!(probe.call_count(), 4);
    assert_eq!(crawler.run_state(), RunState::Finished);
}

#[tokio::test]
async fn test_concurrency_is_never_exceeded() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(20));
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            concurrency: 3,
            ..Default::default()
        },
        fetcher,
    );
    crawler.add_tasks(urls("https://example.com", 12));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 12);
    assert_eq!(probe.call_count(), 12);
    assert!(probe.max_outstanding() <= 3);
    assert!(probe.max_outstanding() >= 2);
}

#[tokio::test]
async fn test_jittered_interval_still_bounded() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(5));
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            concurrency: 2,
            interval: Interval::range(Duration::from_millis(1), Duration::from_millis(15)),
            ..Default::default()
        },
        fetcher,
    );
    crawler.add_tasks(urls("https://example.com", 8));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 8);
    assert!(probe.max_outstanding() <= 2);
}

#[tokio::test]
async fn test_always_timing_out_task_is_failed_once() {
    let fetcher = MockFetcher::with(|_| Err(FetchError::Timeout));
    let probe = fetcher.probe();
    let recorder = Recorder::default();
    let results: Arc<Mutex<Vec<TaskResult>>> = Arc::default();

    let crawler = crawler(
        Settings {
            retry_limit: 3,
            ..Default::default()
        },
        fetcher,
    );
    crawler.on_event(recorder.sink());
    {
        let results = results.clone();
        crawler.add_rule_fn(move |ctx| {
            results.lock().unwrap().push(ctx.result.clone());
            Ok(())
        });
    }
    crawler.add_task("https://slow.example.com/");

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].attempts, 3);
    assert_eq!(report.failures[0].status, None);
    assert_eq!(probe.call_count(), 3);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task.attempt_count(), 3);
    assert!(results[0].body.is_none());
    assert!(results[0].outcome.is_failure());

    assert_eq!(
        recorder.count(|e| matches!(e, SessionEvent::TaskRetried { .. })),
        2
    );
    assert_eq!(
        recorder.count(|e| matches!(e, SessionEvent::TaskRetryExhausted(_))),
        1
    );
}

#[tokio::test]
async fn test_slow_fetcher_times_out_per_request() {
    let fetcher = MockFetcher::ok().delay(Duration::from_secs(5));
    let crawler = crawler(
        Settings {
            retry_limit: 2,
            request: RequestConfig {
                timeout: Some(20),
                ..Default::default()
            },
            ..Default::default()
        },
        fetcher,
    );
    crawler.add_task("https://slow.example.com/");

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 2);
}

#[tokio::test]
async fn test_not_found_is_not_a_failure() {
    let fetcher = MockFetcher::with(|request| {
        if request.url.ends_with("/missing") {
            Ok(FetchResponse::status(404))
        } else {
            Ok(FetchResponse::page(200, "<p>ok</p>"))
        }
    });
    let probe = fetcher.probe();
    let outcomes: Arc<Mutex<Vec<(String, TaskOutcome, bool)>>> = Arc::default();

    let crawler = crawler(Settings::default(), fetcher);
    {
        let outcomes = outcomes.clone();
        crawler.add_rule_fn(move |ctx| {
            outcomes.lock().unwrap().push((
                ctx.task().url().to_string(),
                ctx.result.outcome.clone(),
                ctx.body().is_some(),
            ));
            Ok(())
        });
    }
    crawler.add_tasks(["https://a.com/missing", "https://a.com/present"]);

    let report = crawler.start().await.unwrap();

    assert_eq!(report.failed, 0);
    assert_eq!(report.succeeded, 2);
    assert_eq!(probe.call_count(), 2);

    let outcomes = outcomes.lock().unwrap();
    let missing = outcomes
        .iter()
        .find(|(url, _, _)| url.ends_with("/missing"))
        .unwrap();
    assert_eq!(missing.1, TaskOutcome::NotFound);
    assert!(!missing.2);
}

#[tokio::test]
async fn test_dedup_executes_each_url_once() {
    let fetcher = MockFetcher::ok();
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            dedup: true,
            concurrency: 2,
            ..Default::default()
        },
        fetcher,
    );
    crawler.add_rule("a.com/**", |ctx| {
        // Re-admit everything, including URLs still pending or already done
        ctx.expand(["https://a.com/1", "https://a.com/2", "https://b.com/3"]);
        Ok(())
    })
    .unwrap();
    crawler.add_tasks(["https://a.com/1", "https://a.com/2", "https://a.com/1"]);

    let report = crawler.start().await.unwrap();

    let distinct: BTreeSet<String> = probe.calls().into_iter().collect();
    assert_eq!(probe.call_count(), 3);
    assert_eq!(distinct.len(), 3);
    assert_eq!(report.total, 3);
}

#[tokio::test]
async fn test_pause_then_resume_loses_nothing() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(10));
    let probe = fetcher.probe();
    let crawler = crawler(Settings::default(), fetcher);
    let paused_once = Arc::new(AtomicBool::new(false));

    {
        let paused_once = paused_once.clone();
        crawler.on_event(move |crawler: &Crawler, event: &SessionEvent| {
            if let SessionEvent::TaskStarting { id: 3, .. } = event {
                if !paused_once.swap(true, Ordering::SeqCst) {
                    crawler.pause().unwrap();
                }
            }
        });
    }
    let expected = urls("https://example.com", 10);
    crawler.add_tasks(expected.clone());

    let controller = async {
        while !crawler.is_paused() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // The task that was starting still completes; nothing new starts
        tokio::time::sleep(Duration::from_millis(60)).await;
        let during_pause = probe.call_count();
        assert_eq!(during_pause, 3);
        assert!(crawler.is_paused());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.call_count(), during_pause);

        crawler.resume().unwrap();
        assert!(!crawler.is_paused());
    };

    let (report, ()) = tokio::join!(crawler.start(), controller);
    let report = report.unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.failed, 0);
    assert_eq!(probe.calls(), expected);
}

#[tokio::test]
async fn test_pause_with_cancelling_fetcher_reruns_task() {
    let fetcher = MockFetcher::ok()
        .delay(Duration::from_millis(40))
        .honour_cancel();
    let probe = fetcher.probe();
    let crawler = crawler(Settings::default(), fetcher);
    let handled: Arc<Mutex<Vec<String>>> = Arc::default();

    {
        let handled = handled.clone();
        crawler.add_rule_fn(move |ctx| {
            handled.lock().unwrap().push(ctx.task().url().to_string());
            Ok(())
        });
    }
    crawler.on_event(|crawler: &Crawler, event: &SessionEvent| {
        if let SessionEvent::TaskStarting { id: 1, .. } = event {
            crawler.pause().unwrap();
        }
    });
    crawler.add_tasks(urls("https://example.com", 3));

    let controller = async {
        while !crawler.is_paused() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(crawler.counters().admitted, 0);
        assert_eq!(crawler.pending(), 3);
        crawler.resume().unwrap();
    };

    let (report, ()) = tokio::join!(crawler.start(), controller);
    let report = report.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(probe.call_count(), 4);
    assert_eq!(*handled.lock().unwrap(), urls("https://example.com", 3));
}

#[tokio::test]
async fn test_tasks_added_on_drain_prevent_finish() {
    let fetcher = MockFetcher::ok();
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            drain_await: 200,
            ..Default::default()
        },
        fetcher,
    );
    let injected = Arc::new(AtomicBool::new(false));
    let recorder = Recorder::default();

    crawler.on_event(recorder.sink());
    {
        let injected = injected.clone();
        crawler.on_event(move |crawler: &Crawler, event: &SessionEvent| {
            if let SessionEvent::Drained { .. } = event {
                if !injected.swap(true, Ordering::SeqCst) {
                    crawler.add_tasks(["https://late.com/1", "https://late.com/2"]);
                }
            }
        });
    }
    crawler.add_task("https://early.com/");

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(
        probe.calls(),
        vec!["https://early.com/", "https://late.com/1", "https://late.com/2"]
    );
    assert_eq!(recorder.count(|e| matches!(e, SessionEvent::Drained { .. })), 2);
    assert_eq!(recorder.count(|e| matches!(e, SessionEvent::Finished(_))), 1);
}

#[tokio::test]
async fn test_drained_counters_are_settled() {
    let crawler = crawler(Settings::default(), MockFetcher::ok());
    let recorder = Recorder::default();
    crawler.on_event(recorder.sink());
    crawler.add_tasks(urls("https://example.com", 5));

    crawler.start().await.unwrap();

    let drained = recorder
        .events()
        .into_iter()
        .find_map(|e| match e {
            SessionEvent::Drained { counters } => Some(counters),
            _ => None,
        })
        .unwrap();
    assert_eq!(drained.admitted, 5);
    assert_eq!(drained.completed(), drained.admitted);
}

#[tokio::test]
async fn test_tasks_size_batches_and_readmission() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(10));
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            concurrency: 5,
            tasks_size: 2,
            drain_await: 100,
            ..Default::default()
        },
        fetcher,
    );
    let batch = urls("https://same.example.com", 6);
    let readmitted = Arc::new(AtomicBool::new(false));
    {
        let batch = batch.clone();
        let readmitted = readmitted.clone();
        crawler.on_event(move |crawler: &Crawler, event: &SessionEvent| {
            if let SessionEvent::Drained { .. } = event {
                if !readmitted.swap(true, Ordering::SeqCst) {
                    crawler.add_tasks(batch.clone());
                }
            }
        });
    }
    crawler.add_tasks(batch);

    let report = crawler.start().await.unwrap();

    assert!(probe.max_outstanding() <= 2);
    assert_eq!(report.total, 12);
    assert_eq!(probe.call_count(), 12);
}

#[tokio::test]
async fn test_first_matching_rule_wins() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let crawler = crawler(Settings::default(), MockFetcher::ok());

    {
        let first = first.clone();
        crawler
            .add_rule("a.com/**", move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    {
        let second = second.clone();
        crawler
            .add_rule("b.com/**", move |_| {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    crawler.add_task("https://a.com/x");

    crawler.start().await.unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unmatched_task_warns_and_completes() {
    let recorder = Recorder::default();
    let crawler = crawler(Settings::default(), MockFetcher::ok());
    crawler.on_event(recorder.sink());
    crawler.add_rule("a.com/**", |_| Ok(())).unwrap();
    crawler.add_task("https://c.com/");

    let report = crawler.start().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(
        recorder.count(|e| matches!(e, SessionEvent::NoRuleMatched { .. })),
        1
    );
}

#[tokio::test]
async fn test_attribute_filter_routes_tasks() {
    let articles = Arc::new(AtomicUsize::new(0));
    let others = Arc::new(AtomicUsize::new(0));
    let crawler = crawler(Settings::default(), MockFetcher::ok());

    {
        let articles = articles.clone();
        crawler.register(
            tidepool::Rule::new("example.com/**", move |_| {
                articles.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
            .filter("kind", "article"),
        );
    }
    {
        let others = others.clone();
        crawler.add_rule_fn(move |_| {
            others.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    crawler.add_tasks([
        TaskSpec::page("https://example.com/1").property("kind", "article"),
        TaskSpec::page("https://example.com/2"),
        TaskSpec::page("https://example.com/3").property("kind", "article"),
    ]);

    crawler.start().await.unwrap();

    assert_eq!(articles.load(Ordering::SeqCst), 2);
    assert_eq!(others.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_per_task_handler_bypasses_rules() {
    let by_rule = Arc::new(AtomicUsize::new(0));
    let by_task = Arc::new(AtomicUsize::new(0));
    let crawler = crawler(Settings::default(), MockFetcher::ok());

    {
        let by_rule = by_rule.clone();
        crawler.add_rule_fn(move |_| {
            by_rule.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    {
        let by_task = by_task.clone();
        crawler.add_task(TaskSpec::page("https://a.com/").handler(move |ctx| {
            assert!(ctx.document.is_some());
            by_task.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }
    crawler.add_task("https://b.com/");

    crawler.start().await.unwrap();

    assert_eq!(by_task.load(Ordering::SeqCst), 1);
    assert_eq!(by_rule.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_handlers_are_isolated() {
    let recorder = Recorder::default();
    let handled = Arc::new(AtomicUsize::new(0));
    let crawler = crawler(Settings::default(), MockFetcher::ok());
    crawler.on_event(recorder.sink());

    {
        let handled = handled.clone();
        crawler.add_rule_fn(move |ctx| {
            handled.fetch_add(1, Ordering::SeqCst);
            match ctx.task().url() {
                "https://example.com/0" => panic!("handler blew up"),
                "https://example.com/1" => anyhow::bail!("handler refused"),
                _ => Ok(()),
            }
        });
    }
    crawler.add_tasks(urls("https://example.com", 4));

    let report = crawler.start().await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 4);
    assert_eq!(report.total, 4);
    assert_eq!(report.failed, 0);

    let failures: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::HandlerFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|r| r.contains("handler blew up")));
    assert!(failures.iter().any(|r| r.contains("handler refused")));
}

#[tokio::test]
async fn test_panicking_fetcher_does_not_hang_session() {
    let recorder = Recorder::default();
    let crawler = crawler(
        Settings::default(),
        MockFetcher::with(|request| {
            if request.url.ends_with("/bad") {
                panic!("transport exploded");
            }
            Ok(FetchResponse::page(200, ""))
        }),
    );
    crawler.on_event(recorder.sink());
    crawler.add_tasks(["https://a.com/bad", "https://a.com/good"]);

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures[0].attempts, 1);
    assert_eq!(recorder.count(|e| matches!(e, SessionEvent::Error { .. })), 1);
    assert_eq!(recorder.count(|e| matches!(e, SessionEvent::TaskFailed(_))), 1);
}

#[tokio::test]
async fn test_fetch_panic_after_retry_keeps_attempt_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::default();
    let crawler = {
        let calls = calls.clone();
        crawler(
            Settings {
                retry_limit: 3,
                ..Default::default()
            },
            MockFetcher::with(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(FetchResponse::status(503));
                }
                panic!("transport exploded");
            }),
        )
    };
    crawler.on_event(recorder.sink());
    crawler.add_task("https://a.com/flaky");

    let report = crawler.start().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 2);
    let failed: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::TaskFailed(record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
}

#[tokio::test]
async fn test_stop_keeps_started_and_drops_pending() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(10));
    let probe = fetcher.probe();
    let crawler = crawler(
        Settings {
            drain_await: 5_000,
            ..Default::default()
        },
        fetcher,
    );
    crawler.on_event(|crawler: &Crawler, event: &SessionEvent| {
        if let SessionEvent::TaskStarting { id: 2, .. } = event {
            crawler.stop().unwrap();
            crawler.add_task("https://ignored.com/");
        }
    });
    crawler.add_tasks(urls("https://example.com", 10));

    let started = std::time::Instant::now();
    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.completed(), 2);
    assert_eq!(probe.call_count(), 2);
    assert_eq!(crawler.pending(), 0);
    assert_eq!(crawler.run_state(), RunState::Finished);
    // The grace window is skipped after stop
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_stop_lets_cancel_aware_fetch_finish() {
    let fetcher = MockFetcher::ok()
        .delay(Duration::from_millis(100))
        .honour_cancel();
    let probe = fetcher.probe();
    let handled = Arc::new(AtomicUsize::new(0));
    let crawler = crawler(Settings::default(), fetcher);
    crawler.on_event(|crawler: &Crawler, event: &SessionEvent| {
        if let SessionEvent::TaskStarting { id: 1, .. } = event {
            crawler.stop().unwrap();
        }
    });
    {
        let handled = handled.clone();
        crawler.add_rule_fn(move |_| {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    crawler.add_tasks(urls("https://example.com", 3));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(probe.call_count(), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(crawler.run_state(), RunState::Finished);
}

#[tokio::test]
async fn test_expand_callback_receives_discovered_tasks() {
    let expanded: Arc<Mutex<Vec<String>>> = Arc::default();
    let crawler = crawler(
        Settings::default(),
        MockFetcher::with(|_| {
            Ok(FetchResponse::page(
                200,
                r#"<a href="/next">next</a><a href="/other">other</a>"#,
            ))
        }),
    );

    let rule = tidepool::Rule::new("index", |ctx| {
        if let Some(doc) = ctx.document {
            ctx.expand(doc.links());
        }
        Ok(())
    })
    .unwrap();
    {
        let expanded = expanded.clone();
        crawler.load_rule(
            rule,
            Some(Arc::new(move |crawler: &Crawler, specs: Vec<TaskSpec>| {
                let first: Vec<TaskSpec> = specs.into_iter().take(1).collect();
                expanded
                    .lock()
                    .unwrap()
                    .extend(first.iter().map(|spec| spec.url.clone()));
                crawler.add_tasks(first);
            })),
        );
    }
    crawler.add_rule_fn(|_| Ok(()));
    crawler.add_task("https://site.com/index");

    let report = crawler.start().await.unwrap();

    assert_eq!(*expanded.lock().unwrap(), vec!["https://site.com/next"]);
    assert_eq!(report.total, 2);
}

#[tokio::test]
async fn test_tweak_while_running() {
    let fetcher = MockFetcher::ok().delay(Duration::from_millis(10));
    let probe = fetcher.probe();
    let crawler = crawler(Settings::default(), fetcher);
    crawler.on_event(|crawler: &Crawler, event: &SessionEvent| {
        if let SessionEvent::Started { .. } = event {
            crawler.tweak(|s| s.concurrency = 4).unwrap();
        }
    });
    crawler.add_tasks(urls("https://example.com", 8));

    let report = crawler.start().await.unwrap();

    assert_eq!(report.total, 8);
    assert!(probe.max_outstanding() > 1);
    assert!(probe.max_outstanding() <= 4);
}
