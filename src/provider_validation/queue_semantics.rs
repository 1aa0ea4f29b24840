use crate::provider_validation::{ExecutionMetadata, activity_item, create_instance, create_instance_with_work, poke_item};
use crate::provider_validations::ProviderFactory;
use crate::providers::WorkItem;
use std::time::Duration;

/// Worker items come out in the order the orchestration scheduled them.
pub async fn test_worker_queue_fifo_ordering<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: worker queue FIFO ordering");
    let provider = factory.create_provider().await;
    let items = (2..7).map(|id| activity_item("fifo", id, None)).collect();
    create_instance_with_work(&*provider, "fifo", items).await.unwrap();

    for expected in 2..7 {
        let (item, token) = provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();
        match item {
            WorkItem::ActivityExecute { id, .. } => assert_eq!(id, expected),
            other => panic!("unexpected {other:?}"),
        }
        provider.ack_work_item(&token, None).await.unwrap();
    }
    tracing::info!("✓ Test passed: FIFO ordering verified");
}

/// Fetching does not remove an item; only ack does.
pub async fn test_worker_peek_lock_semantics<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "peek", vec![activity_item("peek", 2, None)])
        .await
        .unwrap();

    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    assert!(
        provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none(),
        "locked item is invisible"
    );

    provider.abandon_work_item(&token, None).await.unwrap();
    let (item, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .expect("abandoned item is visible again");
    assert!(matches!(item, WorkItem::ActivityExecute { id: 2, .. }));
    provider.ack_work_item(&token, None).await.unwrap();
}

/// Ack removes the activity and enqueues its completion in one step.
pub async fn test_worker_ack_atomicity<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "wack", vec![activity_item("wack", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    let completion = WorkItem::ActivityCompleted {
        instance: "wack".to_string(),
        execution_id: 1,
        id: 2,
        result: "ok".to_string(),
    };
    provider
        .ack_work_item(&token, Some(completion.clone()))
        .await
        .unwrap();

    assert!(
        provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none()
    );
    let (item, _) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.messages, vec![completion]);
}

/// Timer completions become visible at `fire_at_ms`, not before.
pub async fn test_timer_delayed_visibility<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "timer").await.unwrap();
    provider
        .enqueue_for_orchestrator(poke_item("timer"), None)
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
            vec![],
            vec![],
            vec![WorkItem::TimerFired {
                instance: "timer".to_string(),
                execution_id: 1,
                id: 2,
                fire_at_ms: crate::now_ms() + 300,
            }],
            ExecutionMetadata::default(),
            vec![],
        )
        .await
        .unwrap();

    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (item, _) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .expect("timer should be due");
    assert!(matches!(item.messages[0], WorkItem::TimerFired { id: 2, .. }));
}

/// A delayed enqueue stays hidden until the delay passes.
pub async fn test_delayed_enqueue_visibility<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    provider
        .enqueue_for_orchestrator(poke_item("delayed"), Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_some()
    );
}

/// Items whose worker died (lock never renewed) are redelivered after expiry.
pub async fn test_lost_lock_token_handling<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let lock_timeout = factory.lock_timeout();
    create_instance_with_work(&*provider, "lost", vec![activity_item("lost", 2, None)])
        .await
        .unwrap();
    let _ = provider.fetch_work_item(lock_timeout, None).await.unwrap().unwrap();

    tokio::time::sleep(lock_timeout + Duration::from_millis(100)).await;
    let (item, token) = provider
        .fetch_work_item(lock_timeout, None)
        .await
        .unwrap()
        .expect("item redelivered after lock expiry");
    assert!(matches!(item, WorkItem::ActivityExecute { id: 2, .. }));
    provider.ack_work_item(&token, None).await.unwrap();
}

/// Messages for an instance come back in enqueue order within one batch.
pub async fn test_orchestrator_batch_preserves_order<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "batch").await.unwrap();
    let messages: Vec<WorkItem> = ["a", "b", "c"]
        .into_iter()
        .map(|data| WorkItem::QueueMessage {
            instance: "batch".to_string(),
            queue: "jobs".to_string(),
            data: data.to_string(),
        })
        .collect();
    for m in &messages {
        provider.enqueue_for_orchestrator(m.clone(), None).await.unwrap();
    }
    let (item, _) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.messages, messages);
}
