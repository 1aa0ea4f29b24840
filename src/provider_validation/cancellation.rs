//! Provider validation tests for activity cancellation.
//!
//! Cancellation is expressed by the orchestration turn: `ack_orchestration_item`
//! receives the identities of activities that lost a race and deletes their
//! worker rows. A worker still holding such a row learns about it when its lock
//! renewal or its ack fails.

use crate::provider_validation::{activity_item, create_instance_with_work, poke_item};
use crate::provider_validations::ProviderFactory;
use crate::providers::{ExecutionMetadata, Provider, ScheduledActivityIdentifier};
use std::time::Duration;

fn activity_id(instance: &str, id: u64) -> ScheduledActivityIdentifier {
    ScheduledActivityIdentifier {
        instance: instance.to_string(),
        execution_id: 1,
        activity_id: id,
    }
}

/// Run one more orchestration turn that only cancels `cancelled`.
async fn ack_cancellations(provider: &dyn Provider, instance: &str, cancelled: Vec<ScheduledActivityIdentifier>) {
    provider
        .enqueue_for_orchestrator(poke_item(instance), None)
        .await
        .unwrap();
    let (_, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .expect("orchestration item");
    provider
        .ack_orchestration_item(
            &lock_token,
            1,
            vec![],
            vec![],
            vec![],
            ExecutionMetadata::default(),
            cancelled,
        )
        .await
        .unwrap();
}

/// Cancelled activities that no worker has picked up yet are simply gone.
pub async fn test_cancelled_activities_deleted_from_worker_queue<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "cancel-queued",
        vec![activity_item("cancel-queued", 2, None), activity_item("cancel-queued", 3, None)],
    )
    .await
    .unwrap();

    ack_cancellations(&*provider, "cancel-queued", vec![activity_id("cancel-queued", 2)]).await;

    let (item, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .expect("surviving activity");
    assert!(matches!(item, crate::providers::WorkItem::ActivityExecute { id: 3, .. }));
    provider.ack_work_item(&token, None).await.unwrap();
    assert!(
        provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none()
    );
}

/// A worker that keeps running a cancelled activity cannot ack it.
pub async fn test_ack_work_item_fails_when_entry_deleted<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "cancel-ack", vec![activity_item("cancel-ack", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();

    ack_cancellations(&*provider, "cancel-ack", vec![activity_id("cancel-ack", 2)]).await;

    let completion = crate::providers::WorkItem::ActivityCompleted {
        instance: "cancel-ack".to_string(),
        execution_id: 1,
        id: 2,
        result: "late".to_string(),
    };
    assert!(provider.ack_work_item(&token, Some(completion)).await.is_err());
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none(),
        "a rejected ack must not enqueue its completion"
    );
}

/// Lock renewal is how a running worker notices cancellation.
pub async fn test_renew_fails_when_entry_deleted<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "cancel-renew", vec![activity_item("cancel-renew", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    provider
        .renew_work_item_lock(&token, Duration::from_secs(30))
        .await
        .unwrap();

    ack_cancellations(&*provider, "cancel-renew", vec![activity_id("cancel-renew", 2)]).await;

    assert!(
        provider
            .renew_work_item_lock(&token, Duration::from_secs(30))
            .await
            .is_err()
    );
}

/// Cancelling something that already completed (or never existed) is not an error.
pub async fn test_cancelling_nonexistent_activities_is_idempotent<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "cancel-noop", vec![activity_item("cancel-noop", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    provider.ack_work_item(&token, None).await.unwrap();

    ack_cancellations(
        &*provider,
        "cancel-noop",
        vec![activity_id("cancel-noop", 2), activity_id("cancel-noop", 99)],
    )
    .await;
    assert_eq!(provider.read("cancel-noop").await.unwrap().len(), 1);
}

/// Cancellation is scoped to the instance and execution named in the identifier.
pub async fn test_cancellation_does_not_touch_other_instances<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "cancel-a", vec![activity_item("cancel-a", 2, None)])
        .await
        .unwrap();
    create_instance_with_work(&*provider, "cancel-b", vec![activity_item("cancel-b", 2, None)])
        .await
        .unwrap();

    ack_cancellations(&*provider, "cancel-a", vec![activity_id("cancel-a", 2)]).await;

    let (item, _) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .expect("other instance keeps its activity");
    assert_eq!(item.instance(), "cancel-b");
}

/// `ack_work_item(token, None)` removes the row without producing a completion.
pub async fn test_ack_work_item_none_deletes_without_enqueue<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "ack-none", vec![activity_item("ack-none", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider
        .fetch_work_item(Duration::from_secs(30), None)
        .await
        .unwrap()
        .unwrap();
    provider.ack_work_item(&token, None).await.unwrap();

    assert!(
        provider
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        provider
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
}
