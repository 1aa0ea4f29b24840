//! Provider validation tests for session affinity.
//!
//! A session serializes its activities: only the oldest item of a session is
//! fetchable, never while a sibling is locked, and only by the owning worker (or
//! by a worker allowed to claim a free or expired session).

use crate::provider_validation::{activity_item, create_instance_with_work, session_config};
use crate::provider_validations::ProviderFactory;
use crate::providers::{SessionFetchConfig, WorkItem};
use std::time::Duration;

const LOCK: Duration = Duration::from_secs(30);

fn activity_id(item: &WorkItem) -> u64 {
    match item {
        WorkItem::ActivityExecute { id, .. } => *id,
        other => panic!("unexpected {other:?}"),
    }
}

pub async fn test_non_session_items_fetchable_by_any_worker<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "plain",
        vec![activity_item("plain", 2, None), activity_item("plain", 3, None)],
    )
    .await
    .unwrap();

    let (a, _) = provider.fetch_work_item(LOCK, None).await.unwrap().unwrap();
    let (b, _) = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-b", false)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((activity_id(&a), activity_id(&b)), (2, 3));
}

/// Fetching without a session config never returns session-bound work.
pub async fn test_none_session_skips_session_items<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "skip", vec![activity_item("skip", 2, Some("s1"))])
        .await
        .unwrap();
    assert!(provider.fetch_work_item(LOCK, None).await.unwrap().is_none());
    assert!(
        provider
            .fetch_work_item(LOCK, Some(&session_config("worker-a", true)))
            .await
            .unwrap()
            .is_some()
    );
}

/// Without spare capacity a worker cannot take a session nobody owns.
pub async fn test_session_claim_requires_capacity<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "cap", vec![activity_item("cap", 2, Some("s1"))])
        .await
        .unwrap();
    assert!(
        provider
            .fetch_work_item(LOCK, Some(&session_config("worker-a", false)))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        provider
            .fetch_work_item(LOCK, Some(&session_config("worker-a", true)))
            .await
            .unwrap()
            .is_some()
    );
}

/// Once claimed, a session's work only goes to its owner, even one at capacity.
pub async fn test_session_affinity_blocks_other_worker<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "affinity",
        vec![
            activity_item("affinity", 2, Some("s1")),
            activity_item("affinity", 3, Some("s1")),
        ],
    )
    .await
    .unwrap();

    let owner = session_config("worker-a", true);
    let (first, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
    assert_eq!(activity_id(&first), 2);
    provider.ack_work_item(&token, None).await.unwrap();

    assert!(
        provider
            .fetch_work_item(LOCK, Some(&session_config("worker-b", true)))
            .await
            .unwrap()
            .is_none(),
        "session owned by worker-a"
    );
    let (second, _) = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-a", false)))
        .await
        .unwrap()
        .expect("owner keeps receiving its session");
    assert_eq!(activity_id(&second), 3);
}

/// Head-of-line: the next item of a session waits until the current one is acked.
pub async fn test_session_items_processed_in_order<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "order",
        (2..5).map(|id| activity_item("order", id, Some("s1"))).collect(),
    )
    .await
    .unwrap();

    let owner = session_config("worker-a", true);
    for expected in 2..5 {
        let (item, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
        assert_eq!(activity_id(&item), expected);
        assert!(
            provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().is_none(),
            "sibling must wait while the head is locked"
        );
        provider.ack_work_item(&token, None).await.unwrap();
    }
}

/// Different sessions can be worked on concurrently by different owners.
pub async fn test_different_sessions_different_workers<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "multi",
        vec![activity_item("multi", 2, Some("s1")), activity_item("multi", 3, Some("s2"))],
    )
    .await
    .unwrap();

    let (a, _) = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-a", true)))
        .await
        .unwrap()
        .unwrap();
    let (b, _) = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-b", true)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.session_id(), Some("s1"));
    assert_eq!(b.session_id(), Some("s2"));
}

/// An expired session lease can be taken over by another worker.
pub async fn test_session_claimable_after_lock_expiry<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let short = factory.lock_timeout();
    create_instance_with_work(
        &*provider,
        "expiry",
        vec![
            activity_item("expiry", 2, Some("s1")),
            activity_item("expiry", 3, Some("s1")),
        ],
    )
    .await
    .unwrap();

    let owner = SessionFetchConfig {
        owner_id: "worker-a".to_string(),
        lock_timeout: short,
        can_claim_new: true,
    };
    let (_, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
    provider.ack_work_item(&token, None).await.unwrap();

    tokio::time::sleep(short + Duration::from_millis(100)).await;
    let (item, _) = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-b", true)))
        .await
        .unwrap()
        .expect("expired session is claimable");
    assert_eq!(activity_id(&item), 3);
    assert_eq!(
        provider
            .renew_session_lock("worker-a", &["s1".to_string()], LOCK)
            .await
            .unwrap(),
        0,
        "previous owner lost the session"
    );
}

/// Only the owner can renew a session lease.
pub async fn test_renew_session_lock_only_owner<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(&*provider, "renew", vec![activity_item("renew", 2, Some("s1"))])
        .await
        .unwrap();
    let _ = provider
        .fetch_work_item(LOCK, Some(&session_config("worker-a", true)))
        .await
        .unwrap()
        .unwrap();

    let sessions = vec!["s1".to_string(), "unknown".to_string()];
    assert_eq!(provider.renew_session_lock("worker-a", &sessions, LOCK).await.unwrap(), 1);
    assert_eq!(provider.renew_session_lock("worker-b", &sessions, LOCK).await.unwrap(), 0);
    assert_eq!(provider.renew_session_lock("worker-a", &[], LOCK).await.unwrap(), 0);
}

/// Release succeeds only for the owner of a session with no queued work.
pub async fn test_release_session<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance_with_work(
        &*provider,
        "release",
        vec![
            activity_item("release", 2, Some("s1")),
            activity_item("release", 3, Some("s1")),
        ],
    )
    .await
    .unwrap();
    let owner = session_config("worker-a", true);
    let (_, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
    provider.ack_work_item(&token, None).await.unwrap();

    assert!(!provider.release_session("worker-a", "s1").await.unwrap(), "work is still queued");
    let (_, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
    provider.ack_work_item(&token, None).await.unwrap();

    assert!(!provider.release_session("worker-b", "s1").await.unwrap(), "not the owner");
    assert!(provider.release_session("worker-a", "s1").await.unwrap());
    assert!(!provider.release_session("worker-a", "s1").await.unwrap(), "already released");
}

/// Cleanup removes expired sessions without work and keeps the rest.
pub async fn test_cleanup_orphaned_sessions<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    let short = factory.lock_timeout();
    create_instance_with_work(
        &*provider,
        "cleanup",
        vec![
            activity_item("cleanup", 2, Some("idle")),
            activity_item("cleanup", 3, Some("busy")),
            activity_item("cleanup", 4, Some("busy")),
        ],
    )
    .await
    .unwrap();
    let owner = SessionFetchConfig {
        owner_id: "worker-a".to_string(),
        lock_timeout: short,
        can_claim_new: true,
    };
    for _ in 0..2 {
        let (_, token) = provider.fetch_work_item(LOCK, Some(&owner)).await.unwrap().unwrap();
        provider.ack_work_item(&token, None).await.unwrap();
    }

    assert_eq!(provider.cleanup_orphaned_sessions().await.unwrap(), 0, "leases still valid");
    tokio::time::sleep(short + Duration::from_millis(100)).await;
    assert_eq!(provider.cleanup_orphaned_sessions().await.unwrap(), 1, "only the idle session goes");
    assert_eq!(
        provider
            .renew_session_lock("worker-a", &["idle".to_string(), "busy".to_string()], LOCK)
            .await
            .unwrap(),
        1
    );
}
