// tests/controller_idempotence.rs

use std::sync::Arc;

use tokio::sync::mpsc;

use batchrelay::bus::{Event, EventBus, EventPublisher, InMemoryBus};
use batchrelay::controller::{
    Controller, ControllerKind, Decision, HANDLED_CAPACITY, IgnoreReason, ScheduleTick, Trigger,
    TriggerSource, spawn_controller,
};
use batchrelay::engine::RuntimeEvent;
use batchrelay::node::{ActionKind, ActivationRequest, NodeBackend, NodeTable};
use batchrelay::types::{CorrelationId, NodeState, StageId};
use chrono::{NaiveDate, TimeZone, Utc};
use batchrelay_test_utils::{ConfigFileBuilder, FakeCall, FakeNodeBackend, init_tracing, wait_until};

fn controller(kind: ControllerKind) -> Controller {
    Controller::new(kind, &ConfigFileBuilder::new().build())
}

fn tick(cid: &str) -> Trigger {
    Trigger::Tick(ScheduleTick {
        correlation_id: CorrelationId::from(cid),
        fired_at: chrono::Utc::now(),
    })
}

#[test]
fn controllers_are_wired_to_their_topics_and_nodes() {
    let cfg = ConfigFileBuilder::new().build();
    let controllers = Controller::pipeline(&cfg);
    let wiring: Vec<_> = controllers
        .iter()
        .map(|c| (c.kind(), c.node().to_string(), c.topic().map(str::to_string)))
        .collect();

    assert_eq!(
        wiring,
        vec![
            (ControllerKind::ActivateCollect, "collector".into(), None),
            (
                ControllerKind::DeactivateCollect,
                "collector".into(),
                Some("collect-done".into())
            ),
            (
                ControllerKind::ActivateProcess,
                "processor".into(),
                Some("collect-done".into())
            ),
            (
                ControllerKind::DeactivateProcess,
                "processor".into(),
                Some("process-done".into())
            ),
        ]
    );
}

#[test]
fn activate_collect_starts_once_per_tick() {
    let mut c = controller(ControllerKind::ActivateCollect);

    let Decision::Act(action) = c.decide(&tick("run-1"), NodeState::Stopped) else {
        panic!("expected a start");
    };
    assert_eq!(action.kind, ActionKind::Start);
    assert_eq!(action.node, "collector");
    assert_eq!(action.stage, StageId::Collect);
    assert_eq!(action.correlation_id.as_str(), "run-1");

    assert_eq!(
        c.decide(&tick("run-1"), NodeState::Stopped),
        Decision::Ignore(IgnoreReason::Duplicate)
    );
}

#[test]
fn handled_ids_are_bounded_to_the_most_recent_runs() {
    let mut c = controller(ControllerKind::ActivateCollect);
    for i in 0..=HANDLED_CAPACITY {
        let cid = format!("run-{i}");
        assert!(matches!(c.decide(&tick(&cid), NodeState::Stopped), Decision::Act(_)));
    }

    // Recent runs are still deduplicated.
    let newest = format!("run-{HANDLED_CAPACITY}");
    assert_eq!(
        c.decide(&tick(&newest), NodeState::Stopped),
        Decision::Ignore(IgnoreReason::Duplicate)
    );
    assert_eq!(
        c.decide(&tick("run-1"), NodeState::Stopped),
        Decision::Ignore(IgnoreReason::Duplicate)
    );
    // The oldest one has been forgotten.
    assert!(matches!(c.decide(&tick("run-0"), NodeState::Stopped), Decision::Act(_)));
}

#[test]
fn starts_carry_the_run_date_fixed_by_the_tick() {
    let mut collect = controller(ControllerKind::ActivateCollect);
    // 02:30 UTC on the 15th is still the 14th at the default UTC-3.
    let tick = Trigger::Tick(ScheduleTick {
        correlation_id: CorrelationId::from("run-1"),
        fired_at: Utc.with_ymd_and_hms(2025, 3, 15, 2, 30, 0).single().expect("time"),
    });
    let Decision::Act(start) = collect.decide(&tick, NodeState::Stopped) else {
        panic!("expected a start");
    };
    assert_eq!(start.run_date, NaiveDate::from_ymd_opt(2025, 3, 14));
    assert_eq!(start.activation().run_date, NaiveDate::from_ymd_opt(2025, 3, 14));

    // Process inherits collect's date, even when it starts the next day.
    let mut process = controller(ControllerKind::ActivateProcess);
    let done = Trigger::Event(
        Event::done("collect-done", CorrelationId::from("run-1")).with_metadata("run_date", "2025-03-14"),
    );
    let Decision::Act(start) = process.decide(&done, NodeState::Stopped) else {
        panic!("expected a start");
    };
    assert_eq!(start.run_date, NaiveDate::from_ymd_opt(2025, 3, 14));

    // Without a date on the event the node dates itself at boot.
    let undated = Trigger::Event(Event::done("collect-done", CorrelationId::from("run-2")));
    let Decision::Act(start) = process.decide(&undated, NodeState::Stopped) else {
        panic!("expected a start");
    };
    assert_eq!(start.run_date, None);
}

#[test]
fn start_is_a_noop_when_node_is_already_up() {
    let mut c = controller(ControllerKind::ActivateCollect);
    assert_eq!(
        c.decide(&tick("run-1"), NodeState::Running),
        Decision::Ignore(IgnoreReason::AlreadyInState)
    );
    assert_eq!(
        c.decide(&tick("run-2"), NodeState::Starting),
        Decision::Ignore(IgnoreReason::AlreadyInState)
    );
}

#[test]
fn deactivate_stops_on_done_and_on_failed() {
    let mut c = controller(ControllerKind::DeactivateCollect);
    let done = Trigger::Event(Event::done("collect-done", CorrelationId::from("run-1")));
    let failed = Trigger::Event(Event::failed(
        "collect-done",
        CorrelationId::from("run-2"),
        "exit code 1",
    ));

    assert!(matches!(c.decide(&done, NodeState::Running), Decision::Act(a) if a.kind == ActionKind::Stop));
    assert!(matches!(c.decide(&failed, NodeState::Running), Decision::Act(a) if a.kind == ActionKind::Stop));
}

#[test]
fn failed_collect_closes_the_run_for_activate_process() {
    let mut c = controller(ControllerKind::ActivateProcess);
    let failed = Trigger::Event(Event::failed(
        "collect-done",
        CorrelationId::from("run-1"),
        "boom",
    ));
    assert_eq!(
        c.decide(&failed, NodeState::Stopped),
        Decision::Ignore(IgnoreReason::NotMyTrigger)
    );

    // A late `done` for the failed run (e.g. after a watchdog timeout) must
    // not start the process node.
    let late = Trigger::Event(Event::done("collect-done", CorrelationId::from("run-1")));
    assert_eq!(
        c.decide(&late, NodeState::Stopped),
        Decision::Ignore(IgnoreReason::Duplicate)
    );

    // Other runs are unaffected.
    let other = Trigger::Event(Event::done("collect-done", CorrelationId::from("run-2")));
    assert!(matches!(c.decide(&other, NodeState::Stopped), Decision::Act(_)));
}

#[test]
fn controllers_ignore_other_topics_and_ticks() {
    let mut c = controller(ControllerKind::DeactivateProcess);
    let wrong_topic = Trigger::Event(Event::done("collect-done", CorrelationId::from("run-1")));

    assert_eq!(
        c.decide(&wrong_topic, NodeState::Running),
        Decision::Ignore(IgnoreReason::NotMyTrigger)
    );
    assert_eq!(
        c.decide(&tick("run-1"), NodeState::Running),
        Decision::Ignore(IgnoreReason::NotMyTrigger)
    );
}

#[test]
fn duplicate_delivery_leads_to_one_stop_per_run() {
    let mut c = controller(ControllerKind::DeactivateCollect);
    let event = Event::done("collect-done", CorrelationId::from("run-1"));

    let acts = (0..5)
        .map(|_| c.decide(&Trigger::Event(event.clone()), NodeState::Running))
        .filter(|d| matches!(d, Decision::Act(_)))
        .count();
    assert_eq!(acts, 1);
}

#[tokio::test]
async fn spawned_controller_stops_once_under_redelivery() {
    init_tracing();
    let cfg = ConfigFileBuilder::new().build();
    let bus = InMemoryBus::new().with_redeliveries(3);
    let table = NodeTable::new();
    let backend = Arc::new(FakeNodeBackend::new(table.clone()));

    backend
        .start(ActivationRequest {
            node: "collector".into(),
            stage: StageId::Collect,
            correlation_id: CorrelationId::from("run-1"),
            run_date: None,
        })
        .await
        .expect("start");

    let (runtime_tx, mut runtime_rx) = mpsc::channel(64);
    let sub = bus.subscribe("collect-done");
    let task = spawn_controller(
        Controller::new(ControllerKind::DeactivateCollect, &cfg),
        TriggerSource::Topic(sub),
        backend.clone(),
        runtime_tx,
    );

    bus.publish(Event::done("collect-done", CorrelationId::from("run-1")))
        .await
        .expect("publish");

    wait_until(|| table.state("collector") == NodeState::Stopped).await;
    // Let any stray redelivery reach the controller.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    task.abort();

    let stops = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, FakeCall::Stop(_)))
        .count();
    assert_eq!(stops, 1);
    assert_eq!(backend.effective_stops("collector"), 1);

    let mut issued = 0;
    while let Ok(event) = runtime_rx.try_recv() {
        if let RuntimeEvent::ActionIssued { controller, action, .. } = event {
            assert_eq!(controller, ControllerKind::DeactivateCollect);
            assert_eq!(action.kind, ActionKind::Stop);
            issued += 1;
        }
    }
    assert_eq!(issued, 1);
}

#[tokio::test]
async fn backend_stop_is_idempotent() {
    let table = NodeTable::new();
    let backend = FakeNodeBackend::new(table.clone());

    backend.stop("collector").await.expect("stop");
    backend.stop("collector").await.expect("stop");

    assert_eq!(backend.calls().len(), 2);
    assert_eq!(backend.effective_stops("collector"), 0);
    assert_eq!(table.state("collector"), NodeState::Stopped);
}

#[tokio::test]
async fn failed_start_is_reported_to_the_runtime() {
    init_tracing();
    let cfg = ConfigFileBuilder::new().build();
    let backend = Arc::new(FakeNodeBackend::new(NodeTable::new()));
    backend.fail_starts_of("collector");

    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let (runtime_tx, mut runtime_rx) = mpsc::channel(64);
    let task = spawn_controller(
        Controller::new(ControllerKind::ActivateCollect, &cfg),
        TriggerSource::Ticks(tick_rx),
        backend.clone(),
        runtime_tx,
    );

    tick_tx.send(ScheduleTick::now()).expect("send tick");

    let first = runtime_rx.recv().await.expect("issued");
    assert!(matches!(first, RuntimeEvent::ActionIssued { .. }));
    let second = runtime_rx.recv().await.expect("failed");
    let RuntimeEvent::ActionFailed { controller, error, .. } = second else {
        panic!("expected ActionFailed, got {second:?}");
    };
    assert_eq!(controller, ControllerKind::ActivateCollect);
    assert!(error.contains("injected start failure"));
    task.abort();
}
