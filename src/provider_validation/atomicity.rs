use crate::provider_validation::{
    Event, EventKind, ExecutionMetadata, activity_item, create_instance, poke_item, start_item, started_event,
    test_metadata,
};
use crate::provider_validations::ProviderFactory;
use crate::providers::WorkItem;
use std::sync::Arc;
use std::time::Duration;

/// All-or-nothing ack: a rejected ack must leave history and both queues untouched.
pub async fn test_atomicity_failure_rollback<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing atomicity: ack failure should rollback all operations");
    let provider = factory.create_provider().await;
    create_instance(&*provider, "instance-A").await.unwrap();
    assert_eq!(provider.read("instance-A").await.unwrap().len(), 1);

    provider
        .enqueue_for_orchestrator(poke_item("instance-A"), None)
        .await
        .unwrap();
    let (_item, _lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let result = provider
        .ack_orchestration_item(
            "invalid-token",
            1,
            vec![Event::with_event_id(
                2,
                "instance-A",
                1,
                None,
                EventKind::ActivityScheduled {
                    name: "Act".to_string(),
                    input: "{}".to_string(),
                    session_id: None,
                },
            )],
            vec![activity_item("instance-A", 2, None)],
            vec![],
            ExecutionMetadata::default(),
            vec![],
        )
        .await;
    assert!(result.is_err(), "ack with an unknown token must fail");

    assert_eq!(provider.read("instance-A").await.unwrap().len(), 1, "history must be unchanged");
    assert!(
        provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none(),
        "no worker item may leak from a failed ack"
    );
    tracing::info!("✓ Test passed: ack failure rollback verified");
}

/// A turn with history, activities, a timer, a signal and a status update commits as one unit.
pub async fn test_multi_operation_atomic_ack<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing atomicity: complex ack should succeed atomically");
    let provider = factory.create_provider().await;

    provider
        .enqueue_for_orchestrator(start_item("instance-B"), None)
        .await
        .unwrap();
    let (_item, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let history_delta = vec![
        started_event("instance-B", 1),
        Event::with_event_id(
            2,
            "instance-B",
            1,
            None,
            EventKind::ActivityScheduled {
                name: "Act".to_string(),
                input: "a".to_string(),
                session_id: None,
            },
        ),
        Event::with_event_id(
            3,
            "instance-B",
            1,
            None,
            EventKind::ActivityScheduled {
                name: "Act".to_string(),
                input: "b".to_string(),
                session_id: None,
            },
        ),
        Event::with_event_id(
            4,
            "instance-B",
            1,
            None,
            EventKind::CustomStatusSet {
                status: Some("busy".to_string()),
            },
        ),
    ];
    let worker_items = vec![activity_item("instance-B", 2, None), activity_item("instance-B", 3, None)];
    let orchestrator_items = vec![WorkItem::TimerFired {
        instance: "instance-B".to_string(),
        execution_id: 1,
        id: 5,
        fire_at_ms: crate::now_ms() + 60_000,
    }];

    provider
        .ack_orchestration_item(
            &lock_token,
            1,
            history_delta,
            worker_items,
            orchestrator_items,
            test_metadata(),
            vec![],
        )
        .await
        .unwrap();

    assert_eq!(provider.read("instance-B").await.unwrap().len(), 4);
    let info = provider.get_instance_info("instance-B").await.unwrap().unwrap();
    assert_eq!(info.orchestration_name, "TestOrch");
    assert_eq!(info.status, "Running");
    assert_eq!(info.custom_status.as_deref(), Some("busy"));
    assert_eq!(info.custom_status_version, 1);

    let (first, t1) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    let (second, t2) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, WorkItem::ActivityExecute { id: 2, .. }));
    assert!(matches!(second, WorkItem::ActivityExecute { id: 3, .. }));
    provider.ack_work_item(&t1, None).await.unwrap();
    provider.ack_work_item(&t2, None).await.unwrap();

    // The timer is committed but not visible yet.
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
    tracing::info!("✓ Test passed: multi-operation atomic ack verified");
}

/// The instance lock survives a failed ack and is released by a successful one.
pub async fn test_lock_released_only_on_successful_ack<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing atomicity: lock should only be released on successful ack");
    let provider = factory.create_provider().await;
    create_instance(&*provider, "instance-C").await.unwrap();

    provider
        .enqueue_for_orchestrator(poke_item("instance-C"), None)
        .await
        .unwrap();
    let (_item, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let bad = provider
        .ack_orchestration_item("bogus", 1, vec![], vec![], vec![], ExecutionMetadata::default(), vec![])
        .await;
    assert!(bad.is_err());

    provider
        .enqueue_for_orchestrator(poke_item("instance-C"), None)
        .await
        .unwrap();
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none(),
        "instance must stay locked after a failed ack"
    );

    provider
        .ack_orchestration_item(&lock_token, 1, vec![], vec![], vec![], ExecutionMetadata::default(), vec![])
        .await
        .unwrap();

    let (item, _) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .expect("instance should be fetchable after ack");
    assert_eq!(item.instance, "instance-C");
    assert_eq!(item.messages.len(), 1, "only the message that arrived during the lock remains");
    tracing::info!("✓ Test passed: lock release on successful ack verified");
}

/// Two concurrent acks with the same token: exactly one wins.
pub async fn test_concurrent_ack_prevention<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing atomicity: concurrent ack prevention");
    let provider = factory.create_provider().await;

    provider
        .enqueue_for_orchestrator(start_item("instance-D"), None)
        .await
        .unwrap();
    let (_item, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let p = Arc::clone(&provider);
        let token = lock_token.clone();
        handles.push(tokio::spawn(async move {
            p.ack_orchestration_item(
                &token,
                1,
                vec![started_event("instance-D", 1)],
                vec![],
                vec![],
                test_metadata(),
                vec![],
            )
            .await
        }));
    }
    let results = futures::future::join_all(handles).await;
    let successes = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(()))))
        .count();
    assert_eq!(successes, 1, "exactly one ack may succeed");
    assert_eq!(provider.read("instance-D").await.unwrap().len(), 1);
    tracing::info!("✓ Test passed: concurrent ack prevention verified");
}

/// Re-acking events that are already stored appends nothing.
pub async fn test_append_is_idempotent_by_event_id<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "instance-E").await.unwrap();

    provider
        .enqueue_for_orchestrator(poke_item("instance-E"), None)
        .await
        .unwrap();
    let (_item, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let set = |id| {
        Event::with_event_id(
            id,
            "instance-E",
            1,
            None,
            EventKind::CustomStatusSet {
                status: Some("x".to_string()),
            },
        )
    };
    provider
        .ack_orchestration_item(
            &lock_token,
            1,
            vec![started_event("instance-E", 1), set(2)],
            vec![],
            vec![],
            ExecutionMetadata::default(),
            vec![],
        )
        .await
        .unwrap();

    let history = provider.read("instance-E").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].event_id, 2);
    let (_, version) = provider.get_custom_status("instance-E", 0).await.unwrap().unwrap();
    assert_eq!(version, 1, "the replayed start event must not count");
}
