mod common;

use common::test_helpers::{GatedSink, ScriptedSink, SlowFlushTarget};
use spool::prelude::*;
use spool::ManualClock;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn second_target_only_gets_what_the_first_left() {
    let clock = ManualClock::new();
    let first = SlowFlushTarget::new(&clock, 80);
    let second = SlowFlushTarget::new(&clock, 5);
    let targets: Vec<Arc<dyn Sink>> = vec![first.clone(), second.clone()];
    let fanout = FanoutSink::new(targets)
        .with_coordinator(FlushCoordinator::new().with_clock(clock.clone()));
    let engine = DispatchEngine::builder()
        .asynchronous(false)
        .sink(fanout)
        .build()
        .expect("engine builds");
    engine.activate().await.expect("engine activates");

    assert!(engine.flush(FlushTimeout::from_millis(100)).await);

    assert_eq!(first.seen(), vec![FlushTimeout::ZERO, FlushTimeout::from_millis(100)]);
    assert_eq!(second.seen(), vec![FlushTimeout::ZERO, FlushTimeout::from_millis(20)]);
}

#[tokio::test]
async fn exhausted_budget_fails_the_flush_but_still_waits_on_every_target() {
    let clock = ManualClock::new();
    let first = SlowFlushTarget::new(&clock, 150);
    let second = SlowFlushTarget::new(&clock, 5);
    let coordinator = FlushCoordinator::new().with_clock(clock.clone());

    let targets: Vec<Arc<dyn Sink>> = vec![first.clone(), second.clone()];
    assert!(!coordinator.flush_all(&targets, FlushTimeout::from_millis(100)).await);
    assert_eq!(second.seen().last(), Some(&FlushTimeout::ZERO));
    assert_eq!(second.seen().len(), 2);
}

#[tokio::test]
async fn engines_can_be_flushed_together() {
    let sinks = [ScriptedSink::new(), ScriptedSink::new()];
    let mut engines: Vec<Arc<DispatchEngine>> = Vec::new();
    for sink in &sinks {
        let engine = DispatchEngine::builder().sink(sink.clone()).build().expect("engine builds");
        engine.activate().await.expect("engine activates");
        engine.dispatch(Payload::from("buffered")).await;
        engines.push(Arc::new(engine));
    }

    assert!(FlushCoordinator::new().flush_all(&engines, FlushTimeout::from_millis(2_000)).await);
    for sink in &sinks {
        assert_eq!(sink.delivered(), vec!["buffered"]);
    }
    for engine in &engines {
        engine.close().await;
    }
}

#[tokio::test]
async fn async_flush_hands_the_remaining_budget_to_the_sink() {
    let sink = ScriptedSink::new();
    let engine = DispatchEngine::builder()
        .sink(sink.clone())
        .with_clock(ManualClock::new())
        .build()
        .expect("engine builds");
    engine.activate().await.expect("engine activates");

    engine.dispatch(Payload::from("one")).await;
    assert!(engine.flush(FlushTimeout::from_millis(300)).await);

    assert_eq!(sink.delivered(), vec!["one"]);
    assert_eq!(sink.flushes(), vec![FlushTimeout::from_millis(300)]);
    engine.close().await;
}

#[tokio::test]
async fn flush_times_out_while_the_sink_is_stuck() {
    let sink = GatedSink::closed();
    let engine = DispatchEngine::builder()
        .sink(sink.clone())
        .shutdown_timeout(Duration::from_millis(50))
        .build()
        .expect("engine builds");
    engine.activate().await.expect("engine activates");

    engine.dispatch(Payload::from("slow")).await;
    assert!(!engine.flush(FlushTimeout::from_millis(30)).await);
    assert!(!engine.flush(FlushTimeout::ZERO).await);

    sink.open(1);
    assert!(engine.flush(FlushTimeout::Infinite).await);
    assert_eq!(sink.delivered(), vec!["slow"]);
    engine.close().await;
}

#[tokio::test]
async fn negative_budget_clamps_to_a_non_blocking_check() {
    let sink = ScriptedSink::new();
    let engine = DispatchEngine::builder().sink(sink.clone()).build().expect("engine builds");
    engine.activate().await.expect("engine activates");

    assert!(engine.flush(FlushTimeout::from_millis(-10)).await);
    engine.close().await;
}

#[tokio::test]
async fn inactive_engines_flush_trivially() {
    let engine =
        DispatchEngine::builder().sink(GatedSink::closed()).build().expect("engine builds");
    assert!(engine.flush(FlushTimeout::ZERO).await);
    engine.close().await;
    assert!(engine.flush(FlushTimeout::Infinite).await);
}

#[tokio::test]
async fn sync_flush_is_not_held_up_by_a_stuck_append() {
    let sink = GatedSink::closed();
    let engine = Arc::new(
        DispatchEngine::builder()
            .asynchronous(false)
            .sink(sink.clone())
            .build()
            .expect("engine builds"),
    );
    engine.activate().await.expect("engine activates");

    let producer = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.dispatch(Payload::from("stuck")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let flushed = tokio::time::timeout(
        Duration::from_secs(2),
        engine.flush(FlushTimeout::from_millis(30)),
    )
    .await;
    assert_eq!(flushed, Ok(true));

    sink.open(1);
    producer.await.expect("producer finishes");
    assert_eq!(sink.delivered(), vec!["stuck"]);
}
