use crate::provider_validation::{ExecutionMetadata, activity_item, create_instance_with_work, start_item};
use crate::provider_validations::ProviderFactory;
use std::time::Duration;

fn provider_lock_timeout<F: ProviderFactory>(factory: &F) -> Duration {
    factory.lock_timeout()
}

/// Locks expire and the instance becomes available again; the stale token is dead.
pub async fn test_lock_expires_after_timeout<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing lock expiration: lock expires after timeout");
    let provider = factory.create_provider().await;
    let lock_timeout = provider_lock_timeout(factory);

    provider
        .enqueue_for_orchestrator(start_item("instance-A"), None)
        .await
        .unwrap();
    let (_, lock_token) = provider.fetch_orchestration_item(lock_timeout).await.unwrap().unwrap();

    assert!(provider.fetch_orchestration_item(lock_timeout).await.unwrap().is_none());

    tokio::time::sleep(lock_timeout + Duration::from_millis(100)).await;

    let (item2, token2) = provider.fetch_orchestration_item(lock_timeout).await.unwrap().unwrap();
    assert_eq!(item2.instance, "instance-A");
    assert_ne!(token2, lock_token, "Should have new lock token");

    let result = provider
        .ack_orchestration_item(&lock_token, 1, vec![], vec![], vec![], ExecutionMetadata::default(), vec![])
        .await;
    assert!(result.is_err());
    tracing::info!("✓ Test passed: lock expiration verified");
}

/// Abandon releases the lock without waiting for expiration.
pub async fn test_abandon_releases_lock_immediately<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing lock expiration: abandon releases lock immediately");
    let provider = factory.create_provider().await;
    let lock_timeout = provider_lock_timeout(factory);

    provider
        .enqueue_for_orchestrator(start_item("instance-A"), None)
        .await
        .unwrap();
    let (_, lock_token) = provider.fetch_orchestration_item(lock_timeout).await.unwrap().unwrap();
    assert!(provider.fetch_orchestration_item(lock_timeout).await.unwrap().is_none());

    provider.abandon_orchestration_item(&lock_token, None).await.unwrap();

    let (item, _) = provider
        .fetch_orchestration_item(lock_timeout)
        .await
        .unwrap()
        .expect("abandoned item should be fetchable immediately");
    assert_eq!(item.messages.len(), 1);
    tracing::info!("✓ Test passed: abandon releases lock verified");
}

/// Renewing an orchestration lock keeps it past its original deadline.
pub async fn test_orchestration_lock_renewal_extends_timeout<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let lock_timeout = provider_lock_timeout(factory);

    provider
        .enqueue_for_orchestrator(start_item("renew-orch"), None)
        .await
        .unwrap();
    let (_, token) = provider.fetch_orchestration_item(lock_timeout).await.unwrap().unwrap();

    tokio::time::sleep(lock_timeout / 2).await;
    provider
        .renew_orchestration_item_lock(&token, lock_timeout)
        .await
        .unwrap();
    tokio::time::sleep(lock_timeout * 3 / 4).await;

    assert!(
        provider.fetch_orchestration_item(lock_timeout).await.unwrap().is_none(),
        "renewed lock must still be held"
    );
    provider
        .ack_orchestration_item(&token, 1, vec![], vec![], vec![], ExecutionMetadata::default(), vec![])
        .await
        .unwrap();
}

/// Worker locks can be renewed with a valid token.
pub async fn test_worker_lock_renewal_success<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "wr-ok", vec![activity_item("wr-ok", 2, None)])
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
    provider.ack_work_item(&token, None).await.unwrap();
}

pub async fn test_worker_lock_renewal_invalid_token<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    assert!(
        provider
            .renew_work_item_lock("invalid", Duration::from_secs(30))
            .await
            .is_err()
    );
}

/// Once another worker took over an expired lock, the old token cannot renew.
pub async fn test_worker_lock_renewal_after_expiration<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let lock_timeout = provider_lock_timeout(factory);
    create_instance_with_work(&*provider, "wr-exp", vec![activity_item("wr-exp", 2, None)])
        .await
        .unwrap();
    let (_, stale) = provider.fetch_work_item(lock_timeout, None).await.unwrap().unwrap();

    tokio::time::sleep(lock_timeout + Duration::from_millis(100)).await;
    let (_, fresh) = provider
        .fetch_work_item(lock_timeout, None)
        .await
        .unwrap()
        .expect("expired work item is redelivered");
    assert_ne!(stale, fresh);

    assert!(provider.renew_work_item_lock(&stale, lock_timeout).await.is_err());
    assert!(provider.ack_work_item(&stale, None).await.is_err());
    provider.ack_work_item(&fresh, None).await.unwrap();
}

/// Renewal pushes the worker lock deadline forward.
pub async fn test_worker_lock_renewal_extends_timeout<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let lock_timeout = provider_lock_timeout(factory);
    create_instance_with_work(&*provider, "wr-ext", vec![activity_item("wr-ext", 2, None)])
        .await
        .unwrap();
    let (_, token) = provider.fetch_work_item(lock_timeout, None).await.unwrap().unwrap();

    tokio::time::sleep(lock_timeout / 2).await;
    provider.renew_work_item_lock(&token, lock_timeout).await.unwrap();
    tokio::time::sleep(lock_timeout * 3 / 4).await;

    assert!(
        provider.fetch_work_item(lock_timeout, None).await.unwrap().is_none(),
        "renewed item must not be redelivered"
    );
    provider.ack_work_item(&token, None).await.unwrap();
}

/// After ack the token is gone.
pub async fn test_worker_lock_renewal_after_ack<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "wr-ack", vec![activity_item("wr-ack", 2, None)])
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
            .renew_work_item_lock(&token, Duration::from_secs(30))
            .await
            .is_err()
    );
}
