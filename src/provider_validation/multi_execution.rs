use crate::provider_validation::{Event, EventKind, ExecutionMetadata, create_instance, poke_item, started_event};
use crate::provider_validations::ProviderFactory;
use crate::providers::{Provider, WorkItem};
use std::time::Duration;

/// Close execution 1 with continue-as-new and start execution 2, the way the
/// runtime does it across two turns.
async fn continue_as_new(provider: &dyn Provider, instance: &str, carry: Vec<(String, String)>) {
    provider
        .enqueue_for_orchestrator(poke_item(instance), None)
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider
        .ack_orchestration_item(
            &token,
            1,
            vec![Event::with_event_id(
                2,
                instance,
                1,
                None,
                EventKind::OrchestrationContinuedAsNew {
                    input: "next".to_string(),
                },
            )],
            vec![],
            vec![WorkItem::ContinueAsNew {
                instance: instance.to_string(),
                orchestration: "TestOrch".to_string(),
                version: "1.0.0".to_string(),
                input: "next".to_string(),
                carry_forward: carry,
            }],
            ExecutionMetadata {
                status: Some("ContinuedAsNew".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .unwrap();

    let (item, token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .expect("continue-as-new item");
    assert_eq!(item.execution_id, 1, "fetch still reports the closed execution");
    assert!(matches!(item.messages[0], WorkItem::ContinueAsNew { .. }));
    provider
        .ack_orchestration_item(
            &token,
            2,
            vec![started_event(instance, 2)],
            vec![],
            vec![],
            ExecutionMetadata {
                status: Some("Running".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .unwrap();
}

/// Each execution keeps its own history.
pub async fn test_execution_isolation<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "exec-iso").await.unwrap();
    continue_as_new(&*provider, "exec-iso", vec![]).await;

    let first = provider.read_with_execution("exec-iso", 1).await.unwrap();
    let second = provider.read_with_execution("exec-iso", 2).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(matches!(first[1].kind, EventKind::OrchestrationContinuedAsNew { .. }));
    assert_eq!(second.len(), 1);
    assert!(second.iter().all(|e| e.execution_id == 2));
}

/// `read` and `latest_execution_id` follow the newest execution.
pub async fn test_latest_execution_detection<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    assert_eq!(provider.latest_execution_id("exec-latest").await.unwrap(), None);
    create_instance(&*provider, "exec-latest").await.unwrap();
    assert_eq!(provider.latest_execution_id("exec-latest").await.unwrap(), Some(1));

    continue_as_new(&*provider, "exec-latest", vec![]).await;
    assert_eq!(provider.latest_execution_id("exec-latest").await.unwrap(), Some(2));
    let latest = provider.read("exec-latest").await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].execution_id, 2);

    let (item, _) = {
        provider
            .enqueue_for_orchestrator(poke_item("exec-latest"), None)
            .await
            .unwrap();
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(item.execution_id, 2);
    assert_eq!(item.history, latest);
}

/// The continue-as-new work item round-trips its carried queue items in order.
pub async fn test_continue_as_new_carries_queue_items<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "exec-carry").await.unwrap();
    provider
        .enqueue_for_orchestrator(poke_item("exec-carry"), None)
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let carry = vec![("jobs".to_string(), "b".to_string()), ("jobs".to_string(), "c".to_string())];
    provider
        .ack_orchestration_item(
            &token,
            1,
            vec![],
            vec![],
            vec![WorkItem::ContinueAsNew {
                instance: "exec-carry".to_string(),
                orchestration: "TestOrch".to_string(),
                version: "1.0.0".to_string(),
                input: "n".to_string(),
                carry_forward: carry.clone(),
            }],
            ExecutionMetadata::default(),
            vec![],
        )
        .await
        .unwrap();

    let (item, _) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    match &item.messages[0] {
        WorkItem::ContinueAsNew { carry_forward, .. } => assert_eq!(carry_forward, &carry),
        other => panic!("unexpected {other:?}"),
    }
}

/// Instance-level status follows the newest execution, while old ones stay readable.
pub async fn test_execution_history_persistence<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "exec-persist").await.unwrap();
    continue_as_new(&*provider, "exec-persist", vec![]).await;

    provider
        .enqueue_for_orchestrator(poke_item("exec-persist"), None)
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider
        .ack_orchestration_item(
            &token,
            2,
            vec![Event::with_event_id(
                2,
                "exec-persist",
                2,
                None,
                EventKind::OrchestrationCompleted {
                    output: "done".to_string(),
                },
            )],
            vec![],
            vec![],
            ExecutionMetadata {
                status: Some("Completed".to_string()),
                output: Some("done".to_string()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .unwrap();

    let info = provider.get_instance_info("exec-persist").await.unwrap().unwrap();
    assert_eq!(info.status, "Completed");
    assert_eq!(info.output.as_deref(), Some("done"));
    assert_eq!(info.current_execution_id, 2);
    assert_eq!(provider.read_with_execution("exec-persist", 1).await.unwrap().len(), 2);
    assert_eq!(provider.read_with_execution("exec-persist", 2).await.unwrap().len(), 2);
    assert_eq!(provider.list_instances().await.unwrap(), vec!["exec-persist".to_string()]);
}
