// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

use super::{setup_test_logging, RecordingMetrics, TestValue};
use crate::context::{Context, ContextError};
use crate::height_gate::HeightGate;
use async_std::future::timeout;
use async_std::task;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn gate(start_height: u64) -> Arc<HeightGate<TestValue>> {
    Arc::new(HeightGate::new(start_height, TestValue::default))
}

#[async_std::test]
async fn reader_waits_for_the_height_to_end() {
    setup_test_logging();
    let metrics = RecordingMetrics::new();
    let gate = Arc::new(HeightGate::new(0, TestValue::default).with_metrics(&metrics));

    gate.start_new_height(1).await;
    gate.with_value(|v| v.push("a")).await;

    let returned = Arc::new(AtomicBool::new(false));
    let reader = {
        let gate = Arc::clone(&gate);
        let returned = Arc::clone(&returned);
        task::spawn(async move {
            let value = gate.get(&Context::background(), 1).await;
            returned.store(true, Ordering::SeqCst);
            value
        })
    };

    task::sleep(Duration::from_millis(30)).await;
    assert!(!returned.load(Ordering::SeqCst), "returned before the height ended");

    gate.with_value(|v| v.push("b")).await;
    gate.end_current_height().await;

    let value = timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader not released by end_current_height")
        .expect("value at the current height");
    assert_eq!(value.items(), vec!["a", "b"]);
    assert_eq!(metrics.counter("height_sync_complete"), 1);
    assert_eq!(metrics.counter("height_sync_timeout"), 0);
    assert_eq!(metrics.points("height_sync_duration").len(), 1);
}

#[async_std::test]
async fn genesis_value_is_returned_immediately() {
    let gate = gate(0);
    gate.with_value(|v| v.push("genesis")).await;

    let value = timeout(
        Duration::from_millis(200),
        gate.get(&Context::background(), 0),
    )
    .await
    .expect("genesis get blocked")
    .expect("genesis value");
    assert_eq!(value.items(), vec!["genesis"]);
}

#[async_std::test]
async fn expired_reader_gets_the_partial_value() {
    let metrics = RecordingMetrics::new();
    let gate = HeightGate::new(0, TestValue::default).with_metrics(&metrics);
    gate.start_new_height(1).await;
    gate.with_value(|v| v.push("partial")).await;

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(30));
    let value = gate.get(&ctx, 1).await.expect("partial value");

    assert_eq!(value.items(), vec!["partial"]);
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    assert_eq!(metrics.counter("height_sync_timeout"), 1);
    assert_eq!(metrics.counter("height_sync_complete"), 0);
    assert_eq!(metrics.points("height_sync_wait_duration").len(), 1);
}

#[async_std::test]
async fn reader_ahead_waits_through_intermediate_heights() {
    let gate = gate(1);
    gate.end_current_height().await;

    let returned = Arc::new(AtomicBool::new(false));
    let reader = {
        let gate = Arc::clone(&gate);
        let returned = Arc::clone(&returned);
        task::spawn(async move {
            let value = gate.get(&Context::background(), 3).await;
            returned.store(true, Ordering::SeqCst);
            value
        })
    };

    gate.start_new_height(2).await;
    gate.with_value(|v| v.push("at 2")).await;
    gate.end_current_height().await;
    task::sleep(Duration::from_millis(30)).await;
    assert!(!returned.load(Ordering::SeqCst), "returned the value of height 2");

    gate.start_new_height(3).await;
    gate.with_value(|v| v.push("at 3")).await;
    task::sleep(Duration::from_millis(30)).await;
    assert!(!returned.load(Ordering::SeqCst), "returned before height 3 ended");

    gate.end_current_height().await;
    let value = timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader never released")
        .expect("value at height 3");
    assert_eq!(value.items(), vec!["at 3"]);
}

#[async_std::test]
async fn expired_reader_behind_gets_nothing() {
    let metrics = RecordingMetrics::new();
    let gate = HeightGate::new(1, TestValue::default).with_metrics(&metrics);

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(30));
    assert!(gate.get(&ctx, 5).await.is_none());
    assert_eq!(metrics.counter("height_sync_height_behind"), 1);
    assert_eq!(metrics.counter("height_sync_timeout"), 1);
}

#[async_std::test]
async fn try_get_reports_a_height_passed_while_waiting() {
    let gate = gate(1);

    let reader = {
        let gate = Arc::clone(&gate);
        task::spawn(async move { gate.try_get(&Context::background(), 3).await })
    };
    task::sleep(Duration::from_millis(20)).await;
    gate.start_new_height(5).await;

    let result = timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader not woken by the height change");
    assert_eq!(result.map(|value| value.is_some()), Err(5));

    // at or ahead of the current height it behaves like get
    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
    assert!(matches!(gate.try_get(&ctx, 5).await, Ok(Some(_))));
    assert!(matches!(gate.try_get(&ctx, 9).await, Ok(None)));
}

#[async_std::test]
async fn cancelled_reader_is_released() {
    let gate = gate(1);
    let (ctx, cancel) = Context::background().with_cancel();

    let reader = {
        let gate = Arc::clone(&gate);
        task::spawn(async move { gate.get(&ctx, 1).await })
    };
    task::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let value = timeout(Duration::from_secs(1), reader)
        .await
        .expect("cancellation did not release the reader");
    assert!(value.is_some());
}

#[async_std::test]
async fn every_height_starts_with_a_fresh_value() {
    let gate = gate(0);
    gate.start_new_height(1).await;
    gate.with_value(|v| v.push("old")).await;
    gate.end_current_height().await;

    let old = gate.get(&Context::background(), 1).await.expect("value");
    gate.start_new_height(2).await;

    gate.with_value(|v| assert!(v.items().is_empty())).await;
    // readers keep the value they were handed
    assert_eq!(old.items(), vec!["old"]);
    assert_eq!(gate.current_height().await, 2);
}

#[async_std::test]
async fn concurrent_workers_populate_one_value() {
    let gate = gate(0);
    gate.start_new_height(1).await;

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let gate = Arc::clone(&gate);
            task::spawn(async move { gate.with_value(|v| v.push(format!("worker {i}"))).await })
        })
        .collect();
    for worker in workers {
        worker.await;
    }
    gate.end_current_height().await;

    let value = gate.get(&Context::background(), 1).await.expect("value");
    assert_eq!(value.items().len(), 8);
}

#[async_std::test]
async fn restarting_the_same_height_is_allowed() {
    let gate = gate(3);
    gate.with_value(|v| v.push("first attempt")).await;
    gate.start_new_height(3).await;
    gate.with_value(|v| assert!(v.items().is_empty())).await;
}

#[test]
#[should_panic(expected = "cannot serve requests in the past")]
fn get_for_a_passed_height_panics() {
    task::block_on(async {
        let gate = gate(0);
        gate.start_new_height(2).await;
        gate.get(&Context::background(), 1).await;
    });
}

#[test]
#[should_panic(expected = "height 1 already ended")]
fn ending_a_height_twice_panics() {
    task::block_on(async {
        let gate = gate(1);
        gate.end_current_height().await;
        gate.end_current_height().await;
    });
}

#[test]
#[should_panic(expected = "cannot move backwards")]
fn moving_backwards_panics() {
    task::block_on(async {
        let gate = gate(5);
        gate.start_new_height(4).await;
    });
}

#[async_std::test]
async fn settled_gate_allows_ended_transitions() {
    let gate = HeightGate::new_settled(5, TestValue::default);
    // the starting height counts as ended
    gate.start_new_height(6).await;
    gate.end_current_height().await;
    gate.start_new_height(7).await;
    assert_eq!(gate.current_height().await, 7);
}

#[test]
#[should_panic(expected = "height 6 not ended before starting new height 7")]
fn settled_gate_refuses_unended_transitions() {
    task::block_on(async {
        let gate = HeightGate::new_settled(5, TestValue::default);
        gate.start_new_height(6).await;
        gate.start_new_height(7).await;
    });
}
