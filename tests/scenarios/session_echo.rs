//! Scenario: two echo calls pinned to one session.
//!
//! Both activities must run on the same runtime, one after the other, and the
//! orchestration stitches their results together in scheduling order.

use duralane::{ActivityContext, ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

#[tokio::test]
async fn session_echo_runs_in_order_on_one_worker() {
    let store = common::in_memory_store();
    let seen: Arc<Mutex<Vec<(String, Option<String>, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let seen_in_activity = seen.clone();
    let activity_registry = ActivityRegistry::builder()
        .register("Echo", move |ctx: ActivityContext, input: String| {
            let seen = seen_in_activity.clone();
            async move {
                seen.lock().unwrap().push((
                    input.clone(),
                    ctx.session_id().map(str::to_string),
                    ctx.worker_id().to_string(),
                ));
                Ok(format!("echo:{input}"))
            }
        })
        .build();

    let orchestration_registry = OrchestrationRegistry::builder()
        .register("SessionEcho", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_activity_on_session("Echo", "hello", "my-session").await?;
            let second = ctx.schedule_activity_on_session("Echo", "world", "my-session").await?;
            Ok(format!("{first}|{second}"))
        })
        .build();

    let rt = Runtime::start_with_options(store.clone(), activity_registry, orchestration_registry, common::fast_options()).await;
    let client = Client::new(store.clone());

    client.start_orchestration("echo-1", "SessionEcho", "").await.unwrap();
    let status = client
        .wait_for_orchestration("echo-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(
        matches!(status, OrchestrationStatus::Completed { ref output, .. } if output == "echo:hello|echo:world"),
        "unexpected status {status:?}"
    );

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "hello");
    assert_eq!(seen[1].0, "world");
    assert!(seen.iter().all(|(_, session, _)| session.as_deref() == Some("my-session")));
    assert!(
        seen.iter().all(|(_, _, worker)| worker.ends_with(rt.runtime_id())),
        "session work stays on the owning runtime"
    );

    let history = client.read_history("echo-1").await.unwrap();
    let sessions: Vec<_> = history
        .iter()
        .filter_map(|e| match &e.kind {
            duralane::EventKind::ActivityScheduled { session_id, .. } => Some(session_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sessions, vec![Some("my-session".to_string()); 2]);

    rt.shutdown(None).await;
}

/// The same flow survives a runtime restart against a persistent store.
#[tokio::test]
async fn session_echo_on_sqlite() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activity_registry = ActivityRegistry::builder()
        .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(format!("echo:{input}")) })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("SessionEcho", |ctx: OrchestrationContext, input: String| async move {
            let mut parts = Vec::new();
            for word in input.split(' ') {
                parts.push(ctx.schedule_activity_on_session("Echo", word, "s").await?);
            }
            Ok(parts.join("|"))
        })
        .build();

    let rt = Runtime::start_with_options(store.clone(), activity_registry, orchestration_registry, common::fast_options()).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("echo-sqlite", "SessionEcho", "a b c")
        .await
        .unwrap();

    match client
        .wait_for_orchestration("echo-sqlite", Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output, .. } => assert_eq!(output, "echo:a|echo:b|echo:c"),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown(None).await;
}
