//! End-to-end tests for session-affine activities.
//!
//! Tests verify session routing through the full runtime stack:
//! orchestration → replay engine → dispatcher → provider → worker.
#![allow(clippy::unwrap_used)]
#![allow(clippy::clone_on_ref_ptr)]
#![allow(clippy::expect_used)]

use duralane::providers::Provider;
use duralane::runtime::{self, RuntimeOptions};
use duralane::{ActivityContext, ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
mod common;

/// Per-call record kept by the test activities.
#[derive(Debug, Clone)]
struct Call {
    input: String,
    session: Option<String>,
    worker: String,
    started: Instant,
    finished: Instant,
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Recorder {
    /// Activity that sleeps `hold` and records what it saw.
    fn activities(&self, hold: Duration) -> ActivityRegistry {
        let rec = self.clone();
        ActivityRegistry::builder()
            .register("Record", move |ctx: ActivityContext, input: String| {
                let rec = rec.clone();
                async move {
                    let now = rec.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    rec.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    let started = Instant::now();
                    tokio::time::sleep(hold).await;
                    rec.in_flight.fetch_sub(1, Ordering::SeqCst);
                    rec.calls.lock().unwrap().push(Call {
                        input: input.clone(),
                        session: ctx.session_id().map(str::to_string),
                        worker: ctx.worker_id().to_string(),
                        started,
                        finished: Instant::now(),
                    });
                    Ok(input)
                }
            })
            .build()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

/// Schedules `input` as a comma-separated list of `session:value` pairs, all at once.
fn fan_out_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, input: String| async move {
            let tasks = input
                .split(',')
                .map(|pair| match pair.split_once(':') {
                    Some(("-", value)) => ctx.schedule_activity("Record", value).into_task(),
                    Some((session, value)) => ctx.schedule_activity_on_session("Record", value, session).into_task(),
                    None => ctx.schedule_activity("Record", pair).into_task(),
                })
                .collect();
            let results = ctx.all(tasks).await;
            let values: Result<Vec<String>, String> = results.into_iter().map(|r| r.map(Option::unwrap_or_default)).collect();
            Ok(values?.join(","))
        })
        .build()
}

fn options() -> RuntimeOptions {
    RuntimeOptions {
        worker_concurrency: 4,
        ..common::fast_options()
    }
}

/// Activities of one session run one at a time, in the order they were scheduled,
/// even when the runtime has idle workers.
#[tokio::test]
async fn session_activities_are_serialized_in_order() {
    let store = common::in_memory_store();
    let rec = Recorder::default();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        rec.activities(Duration::from_millis(30)),
        fan_out_orchestrations(),
        options(),
    )
    .await;
    let client = Client::new(store.clone());

    client
        .start_orchestration("sess-order", "FanOut", "s:1,s:2,s:3,s:4,s:5")
        .await
        .unwrap();
    match client
        .wait_for_orchestration("sess-order", Duration::from_secs(5))
        .await
        .unwrap()
    {
        runtime::OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "1,2,3,4,5"),
        other => panic!("unexpected {other:?}"),
    }

    let calls = rec.calls();
    let order: Vec<_> = calls.iter().map(|c| c.input.as_str()).collect();
    assert_eq!(order, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1, "session work overlapped");
    assert!(calls.windows(2).all(|w| w[0].finished <= w[1].started));
    rt.shutdown(None).await;
}

/// Work without a session is not serialized.
#[tokio::test]
async fn plain_activities_run_in_parallel() {
    let store = common::in_memory_store();
    let rec = Recorder::default();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        rec.activities(Duration::from_millis(200)),
        fan_out_orchestrations(),
        options(),
    )
    .await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("sess-plain", "FanOut", "-:a,-:b,-:c,-:d")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("sess-plain", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, runtime::OrchestrationStatus::Completed { ref output, .. } if output == "a,b,c,d"));
    assert!(rec.max_in_flight.load(Ordering::SeqCst) > 1);
    assert!(rec.calls().iter().all(|c| c.session.is_none()));
    rt.shutdown(None).await;
}

/// Two runtimes share a store: all work of a session lands on one of them.
#[tokio::test]
async fn session_is_owned_by_one_runtime() {
    let store: Arc<dyn Provider> = common::in_memory_store();
    let rec = Recorder::default();
    let rt_a = runtime::Runtime::start_with_options(
        store.clone(),
        rec.activities(Duration::from_millis(20)),
        fan_out_orchestrations(),
        RuntimeOptions {
            worker_identity: Some("node-a".into()),
            ..options()
        },
    )
    .await;
    let rt_b = runtime::Runtime::start_with_options(
        store.clone(),
        rec.activities(Duration::from_millis(20)),
        fan_out_orchestrations(),
        RuntimeOptions {
            worker_identity: Some("node-b".into()),
            ..options()
        },
    )
    .await;
    let client = Client::new(store.clone());

    client
        .start_orchestration("sess-own", "FanOut", "x:1,y:1,x:2,y:2,x:3,y:3,x:4,y:4")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("sess-own", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, runtime::OrchestrationStatus::Completed { .. }), "{status:?}");

    let calls = rec.calls();
    for session in ["x", "y"] {
        let nodes: std::collections::HashSet<_> = calls
            .iter()
            .filter(|c| c.session.as_deref() == Some(session))
            .map(|c| c.worker.rsplit('-').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(nodes.len(), 1, "session {session} ran on {nodes:?}");
    }
    rt_a.shutdown(None).await;
    rt_b.shutdown(None).await;
}

/// With room for a single session, a second session waits until the first one
/// goes idle and is released; plain work is never blocked.
#[tokio::test]
async fn session_capacity_is_respected() {
    let store = common::in_memory_store();
    let rec = Recorder::default();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        rec.activities(Duration::from_millis(20)),
        fan_out_orchestrations(),
        RuntimeOptions {
            max_sessions_per_runtime: 1,
            session_idle_timeout: Duration::from_millis(200),
            ..options()
        },
    )
    .await;
    let client = Client::new(store.clone());

    client
        .start_orchestration("sess-cap", "FanOut", "first:1,second:2,-:3")
        .await
        .unwrap();
    match client
        .wait_for_orchestration("sess-cap", Duration::from_secs(10))
        .await
        .unwrap()
    {
        runtime::OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "1,2,3"),
        other => panic!("unexpected {other:?}"),
    }

    let calls = rec.calls();
    let find = |input: &str| calls.iter().find(|c| c.input == input).cloned().unwrap();
    let (a, b, plain) = (find("1"), find("2"), find("3"));
    let (earlier, later) = if a.started <= b.started { (a, b) } else { (b, a) };
    assert!(
        later.started >= earlier.finished + Duration::from_millis(150),
        "second session claimed before the first was released"
    );
    assert!(plain.finished <= later.started, "plain work must not queue behind sessions");
    rt.shutdown(None).await;
}
