// tests/bus_events.rs

use std::time::Duration;

use tempfile::tempdir;

use batchrelay::bus::memory::DEFAULT_HISTORY_LIMIT;
use batchrelay::bus::{CommandPublisher, Event, EventBus, EventPublisher, InMemoryBus, spawn_event_source};
use batchrelay::errors::BatchrelayError;
use batchrelay::types::{CorrelationId, EventStatus};
use batchrelay_test_utils::{init_tracing, wait_until, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn event_wire_format_uses_camel_case_keys() -> TestResult {
    let event = Event::done("collect-done", CorrelationId::from("run-1")).with_metadata("node", "n1");
    let value: serde_json::Value = serde_json::from_str(&event.to_json()?)?;

    assert_eq!(value["topic"], "collect-done");
    assert_eq!(value["status"], "done");
    assert_eq!(value["correlationId"], "run-1");
    assert_eq!(value["metadata"]["node"], "n1");
    assert!(value["timestamp"].is_string());
    assert!(value.get("correlation_id").is_none());
    Ok(())
}

#[test]
fn events_without_metadata_decode() -> TestResult {
    let event = Event::from_json(
        r#"{"topic":"process-done","status":"failed","timestamp":"2025-03-14T09:42:00Z","correlationId":"abc"}"#,
    )?;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.correlation_id.as_str(), "abc");
    assert!(event.metadata.is_empty());
    assert!(!event.is_done());
    assert!(event.reason().is_none());
    Ok(())
}

#[test]
fn malformed_events_are_rejected() {
    assert!(Event::from_json(r#"{"topic":"x","status":"maybe"}"#).is_err());
    assert!(Event::from_json("not json").is_err());
}

#[tokio::test]
async fn subscribers_only_see_events_published_after_subscribing() -> TestResult {
    let bus = InMemoryBus::new();
    bus.publish(Event::done("collect-done", CorrelationId::from("early"))).await?;

    let mut sub = bus.subscribe("collect-done");
    let mut other = bus.subscribe("process-done");
    bus.publish(Event::done("collect-done", CorrelationId::from("late"))).await?;

    assert_eq!(sub.try_recv().map(|e| e.correlation_id), Some(CorrelationId::from("late")));
    assert!(sub.try_recv().is_none());
    assert!(other.try_recv().is_none());
    assert_eq!(bus.history().len(), 2);
    Ok(())
}

#[tokio::test]
async fn redeliveries_duplicate_every_delivery() -> TestResult {
    let bus = InMemoryBus::new().with_redeliveries(2);
    let mut a = bus.subscribe("t");
    let mut b = bus.subscribe("t");

    assert_eq!(bus.publish_now(Event::done("t", CorrelationId::from("r"))), 6);
    for sub in [&mut a, &mut b] {
        let mut seen = 0;
        while sub.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }
    // History records publications, not deliveries.
    assert_eq!(bus.history().len(), 1);
    Ok(())
}

#[test]
fn history_keeps_only_the_most_recent_publications() {
    let bus = InMemoryBus::new().with_history_limit(3);
    for i in 0..5 {
        bus.publish_now(Event::done("t", CorrelationId::from(format!("run-{i}").as_str())));
    }

    let kept: Vec<_> = bus
        .history()
        .into_iter()
        .map(|e| e.correlation_id.to_string())
        .collect();
    assert_eq!(kept, vec!["run-2", "run-3", "run-4"]);

    let unbounded = InMemoryBus::new();
    for _ in 0..DEFAULT_HISTORY_LIMIT + 10 {
        unbounded.publish_now(Event::done("t", CorrelationId::from("r")));
    }
    assert_eq!(unbounded.history().len(), DEFAULT_HISTORY_LIMIT);
}

#[tokio::test]
async fn dropped_subscriptions_are_pruned() {
    let bus = InMemoryBus::new();
    let sub = bus.subscribe("t");
    assert_eq!(bus.subscriber_count("t"), 1);
    drop(sub);
    assert_eq!(bus.publish_now(Event::done("t", CorrelationId::from("r"))), 0);
    assert_eq!(bus.subscriber_count("t"), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn command_publisher_passes_the_event_in_the_environment() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let template = format!(
        "printf '%s' \"$BATCHRELAY_EVENT\" > {}/{{topic}}.json",
        dir.path().display()
    );
    let publisher = CommandPublisher::new(template);

    publisher
        .publish(Event::failed("collect-done", CorrelationId::from("run-3"), "exit code 1"))
        .await?;

    let written = std::fs::read_to_string(dir.path().join("collect-done.json"))?;
    let event = Event::from_json(&written)?;
    assert_eq!(event.topic, "collect-done");
    assert_eq!(event.reason(), Some("exit code 1"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn command_publisher_reports_a_failing_command() {
    let publisher = CommandPublisher::new("echo unreachable >&2; exit 7");
    let err = publisher
        .publish(Event::done("collect-done", CorrelationId::from("r")))
        .await
        .expect_err("publish should fail");
    let chain = match err {
        BatchrelayError::Other(chain) => chain,
        other => panic!("expected a command error, got {other:?}"),
    };
    let msg = format!("{chain:#}");
    assert!(msg.contains("topic 'collect-done'"), "{msg}");
    assert!(msg.contains("unreachable"), "{msg}");
}

#[cfg(unix)]
#[tokio::test]
async fn event_source_forwards_valid_lines_and_skips_garbage() -> TestResult {
    init_tracing();
    let bus = InMemoryBus::new();
    let mut sub = bus.subscribe("collect-done");

    let good = Event::done("collect-done", CorrelationId::from("from-sns")).to_json()?;
    let script = format!("echo 'garbage'; echo ''; echo '{good}'");
    let task = spawn_event_source(script, bus.clone())?;

    let event = with_timeout(sub.recv()).await.expect("forwarded event");
    assert_eq!(event.correlation_id.as_str(), "from-sns");

    with_timeout(task).await?;
    assert_eq!(bus.history().len(), 1);
    Ok(())
}

#[tokio::test]
async fn publish_is_visible_to_waiting_subscribers() {
    let bus = InMemoryBus::new();
    let mut sub = bus.subscribe("t");
    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish_now(Event::done("t", CorrelationId::from("r")));
    });

    let mut got = None;
    wait_until(|| {
        got = sub.try_recv();
        got.is_some()
    })
    .await;
    assert_eq!(got.map(|e| e.correlation_id), Some(CorrelationId::from("r")));
}
