//! Scenario: a short timer raced against an activity that never finishes in time.
//!
//! The timer wins, the orchestration completes, and the losing activity is
//! cancelled: its queued work is withdrawn and the running handler observes it.

use duralane::{
    ActivityContext, ActivityRegistry, Client, EventKind, OrchestrationContext, OrchestrationRegistry,
    OrchestrationStatus, Runtime, RuntimeOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

#[tokio::test]
async fn timer_wins_and_slow_activity_is_cancelled() {
    let store = common::in_memory_store();
    let observed = Arc::new(AtomicBool::new(false));

    let observed_in_activity = observed.clone();
    let activity_registry = ActivityRegistry::builder()
        .register("Glacial", move |ctx: ActivityContext, _input: String| {
            let observed = observed_in_activity.clone();
            async move {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        observed.store(true, Ordering::SeqCst);
                        Err("cancelled".to_string())
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok("too late".to_string()),
                }
            }
        })
        .build();

    let orchestration_registry = OrchestrationRegistry::builder()
        .register("Deadline", |ctx: OrchestrationContext, _input: String| async move {
            let timeout = ctx.schedule_timer(Duration::from_millis(50)).into_task();
            let slow = ctx.schedule_activity("Glacial", "").into_task();
            let winner = ctx.race(vec![timeout, slow]).await;
            let value = winner.value.clone()?;
            Ok(serde_json::json!({ "index": winner.index, "value": value }).to_string())
        })
        .build();

    // Short worker lease so the lost lock is noticed quickly.
    let options = RuntimeOptions {
        worker_lock_timeout: Duration::from_millis(600),
        ..common::fast_options()
    };
    let rt = Runtime::start_with_options(store.clone(), activity_registry, orchestration_registry, options).await;
    let client = Client::new(store.clone());

    client.start_orchestration("race-1", "Deadline", "").await.unwrap();
    let status = client
        .wait_for_orchestration("race-1", Duration::from_secs(5))
        .await
        .unwrap();
    let output = match status {
        OrchestrationStatus::Completed { output, .. } => output,
        other => panic!("unexpected status {other:?}"),
    };
    let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(parsed["index"], 0);
    assert!(parsed["value"].is_null());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !observed.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed.load(Ordering::SeqCst), "running activity never saw cancellation");

    let history = client.read_history("race-1").await.unwrap();
    assert!(
        !history
            .iter()
            .any(|e| matches!(e.kind, EventKind::ActivityCompleted { .. } | EventKind::ActivityFailed { .. })),
        "the cancelled activity must not report back"
    );

    rt.shutdown(None).await;
}

/// When the activity wins, the timer is simply dropped.
#[tokio::test]
async fn fast_activity_beats_timer() {
    let store = common::in_memory_store();
    let activity_registry = ActivityRegistry::builder()
        .register("Quick", |_ctx: ActivityContext, input: String| async move { Ok(format!("quick:{input}")) })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("Deadline", |ctx: OrchestrationContext, input: String| async move {
            let timeout = ctx.schedule_timer(Duration::from_secs(60)).into_task();
            let quick = ctx.schedule_activity("Quick", input).into_task();
            let winner = ctx.race(vec![timeout, quick]).await;
            Ok(format!("{}:{}", winner.index, winner.value?.unwrap_or_default()))
        })
        .build();

    let rt = Runtime::start_with_options(store.clone(), activity_registry, orchestration_registry, common::fast_options()).await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-2", "Deadline", "x").await.unwrap();
    match client
        .wait_for_orchestration("race-2", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "1:quick:x"),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown(None).await;
}
