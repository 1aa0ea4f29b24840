//! Sample orchestrations exercising the public API end to end.
#![allow(clippy::unwrap_used)]
#![allow(clippy::clone_on_ref_ptr)]
#![allow(clippy::expect_used)]

use duralane::runtime::{self};
use duralane::{
    ActivityContext, ActivityRegistry, Client, EventKind, OrchestrationContext, OrchestrationRegistry,
    OrchestrationStatus, Provider,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
mod common;

fn greetings() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Hello", |_ctx: ActivityContext, input: String| async move { Ok(format!("Hello, {input}!")) })
        .register("Fail", |_ctx: ActivityContext, input: String| async move { Err(format!("no:{input}")) })
        .build()
}

async fn run_to_completion(
    store: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    name: &str,
    instance: &str,
    input: &str,
) -> OrchestrationStatus {
    let rt = runtime::Runtime::start_with_options(store.clone(), greetings(), orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());
    client.start_orchestration(instance, name, input).await.unwrap();
    let status = client
        .wait_for_orchestration(instance, Duration::from_secs(5))
        .await
        .unwrap();
    rt.shutdown(None).await;
    status
}

fn output(status: OrchestrationStatus) -> String {
    match status {
        OrchestrationStatus::Completed { output, .. } => output,
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn sample_hello_world() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("HelloWorld", |ctx: OrchestrationContext, input: String| async move {
            let first = ctx.schedule_activity("Hello", input).await?;
            let _second = ctx.schedule_activity("Hello", "again").await?;
            Ok(first)
        })
        .build();
    let status = run_to_completion(store.clone(), orchestrations, "HelloWorld", "sample-hello", "Rust").await;
    assert_eq!(output(status), "Hello, Rust!");

    let hist = store.read("sample-hello").await.unwrap();
    assert_eq!(
        common::kinds(&hist),
        vec![
            "OrchestrationStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityCompleted",
            "OrchestrationCompleted"
        ]
    );
    let ids: Vec<u64> = hist.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (1..=6).collect::<Vec<_>>());
    assert_eq!(hist[2].source_event_id, Some(2));
    assert_eq!(hist[4].source_event_id, Some(4));
}

#[tokio::test]
async fn sample_control_flow_and_loop() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Loop", |ctx: OrchestrationContext, input: String| async move {
            let n: usize = input.parse().map_err(|_| format!("bad count {input}"))?;
            let mut names = Vec::new();
            for i in 0..n {
                let who = if i % 2 == 0 { "even" } else { "odd" };
                names.push(ctx.schedule_activity("Hello", who).await?);
            }
            Ok(names.join(" "))
        })
        .build();
    let status = run_to_completion(common::in_memory_store(), orchestrations, "Loop", "sample-loop", "3").await;
    assert_eq!(output(status), "Hello, even! Hello, odd! Hello, even!");
}

#[tokio::test]
async fn sample_timer_delays_completion() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Delay", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_millis(200)).await;
            Ok("late".to_string())
        })
        .build();
    let started = Instant::now();
    let status = run_to_completion(common::in_memory_store(), orchestrations, "Delay", "sample-timer", "").await;
    assert_eq!(output(status), "late");
    assert!(started.elapsed() >= Duration::from_millis(200));
}

/// Fan out, fan in: `all` returns one slot per task, in input order, failures included.
#[tokio::test]
async fn sample_fan_out_fan_in() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            let tasks = vec![
                ctx.schedule_activity("Hello", "a").into_task(),
                ctx.schedule_activity("Fail", "b").into_task(),
                ctx.schedule_timer(Duration::from_millis(10)).into_task(),
                ctx.schedule_activity("Hello", "c").into_task(),
            ];
            let slots = ctx.all(tasks).await;
            let rendered: Vec<String> = slots
                .into_iter()
                .map(|slot| match slot {
                    Ok(Some(v)) => format!("ok({v})"),
                    Ok(None) => "ok".to_string(),
                    Err(e) => format!("err({e})"),
                })
                .collect();
            Ok(rendered.join(";"))
        })
        .build();
    let status = run_to_completion(common::in_memory_store(), orchestrations, "FanOut", "sample-fan", "").await;
    assert_eq!(output(status), "ok(Hello, a!);err(no:b);ok;ok(Hello, c!)");
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Greeting {
    name: String,
    times: u32,
}

#[tokio::test]
async fn sample_typed_orchestration_and_activity() {
    let store = common::in_memory_store();
    let activities = ActivityRegistry::builder()
        .register_typed("Repeat", |_ctx: ActivityContext, g: Greeting| async move {
            Ok::<_, String>(vec![g.name; g.times as usize])
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("Greet", |ctx: OrchestrationContext, g: Greeting| async move {
            let names: Vec<String> = ctx.schedule_activity_typed("Repeat", &g).await?;
            Ok::<_, String>(names.len())
        })
        .build();
    let rt = runtime::Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration_typed(
            "sample-typed",
            "Greet",
            Greeting {
                name: "ada".into(),
                times: 3,
            },
        )
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("sample-typed", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(output(status), "3");
    rt.shutdown(None).await;
}

/// Status moves from NotFound to Running to Completed; a second start for the
/// same id changes nothing.
#[tokio::test]
async fn sample_status_lifecycle_and_duplicate_start() {
    let store = common::in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Gate", |ctx: OrchestrationContext, input: String| async move {
            let go = ctx.wait_for_event("Go").await;
            Ok(format!("{input}:{go}"))
        })
        .build();
    let rt = runtime::Runtime::start_with_options(store.clone(), greetings(), orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    assert_eq!(
        client.get_orchestration_status("sample-gate").await.unwrap(),
        OrchestrationStatus::NotFound
    );
    client.start_orchestration("sample-gate", "Gate", "first").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "sample-gate", "Go", 3000).await);
    assert!(matches!(
        client.get_orchestration_status("sample-gate").await.unwrap(),
        OrchestrationStatus::Running { .. }
    ));

    client.start_orchestration("sample-gate", "Gate", "second").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.raise_event("sample-gate", "Go", "open").await.unwrap();
    let status = client
        .wait_for_orchestration("sample-gate", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(output(status), "first:open");

    let hist = client.read_history("sample-gate").await.unwrap();
    assert_eq!(
        hist.iter()
            .filter(|e| matches!(e.kind, EventKind::OrchestrationStarted { .. }))
            .count(),
        1
    );
    assert_eq!(client.list_instances().await.unwrap(), vec!["sample-gate".to_string()]);
    rt.shutdown(None).await;
}
