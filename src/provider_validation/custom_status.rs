//! Provider validation tests for custom status.
//!
//! These tests validate that a Provider implementation correctly applies
//! `CustomStatusSet` events in history_delta and answers `get_custom_status()`.

use crate::EventKind;
use crate::provider_validation::{Event, ExecutionMetadata, create_instance, poke_item};
use crate::provider_validations::ProviderFactory;
use crate::providers::Provider;
use std::time::Duration;

/// Helper: poke → fetch → ack with the given delta.
async fn ack_turn(provider: &dyn Provider, instance: &str, execution_id: u64, history_delta: Vec<Event>) {
    provider
        .enqueue_for_orchestrator(poke_item(instance), None)
        .await
        .unwrap();
    let (_, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expected orchestration item");

    provider
        .ack_orchestration_item(
            &lock_token,
            execution_id,
            history_delta,
            vec![],
            vec![],
            ExecutionMetadata::default(),
            vec![],
        )
        .await
        .unwrap();
}

fn status_event(instance: &str, event_id: u64, status: Option<&str>) -> Event {
    Event::with_event_id(
        event_id,
        instance,
        1,
        None,
        EventKind::CustomStatusSet {
            status: status.map(str::to_string),
        },
    )
}

// =============================================================================
// Set / clear
// =============================================================================

/// Acking a `CustomStatusSet { status: Some(..) }` writes the value and bumps the version.
pub async fn test_custom_status_set<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-set").await.unwrap();

    ack_turn(&*provider, "cs-set", 1, vec![status_event("cs-set", 2, Some("progress"))]).await;

    let (status, version) = provider
        .get_custom_status("cs-set", 0)
        .await
        .unwrap()
        .expect("expected custom_status to be present");
    assert_eq!(status, Some("progress".to_string()));
    assert_eq!(version, 1);
}

/// `status: None` clears the value but still counts as a change.
pub async fn test_custom_status_clear<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-clear").await.unwrap();

    ack_turn(&*provider, "cs-clear", 1, vec![status_event("cs-clear", 2, Some("temp"))]).await;
    ack_turn(&*provider, "cs-clear", 1, vec![status_event("cs-clear", 3, None)]).await;

    let (status, version) = provider.get_custom_status("cs-clear", 0).await.unwrap().unwrap();
    assert_eq!(status, None);
    assert_eq!(version, 2);
}

/// A turn without status events leaves value and version alone.
pub async fn test_custom_status_none_preserves<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-keep").await.unwrap();

    ack_turn(&*provider, "cs-keep", 1, vec![status_event("cs-keep", 2, Some("kept"))]).await;
    ack_turn(&*provider, "cs-keep", 1, vec![]).await;

    let (status, version) = provider.get_custom_status("cs-keep", 0).await.unwrap().unwrap();
    assert_eq!(status.as_deref(), Some("kept"));
    assert_eq!(version, 1);
}

// =============================================================================
// Versioning
// =============================================================================

/// Several status events in one delta each count; the last value wins.
pub async fn test_custom_status_version_increments<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-inc").await.unwrap();

    ack_turn(
        &*provider,
        "cs-inc",
        1,
        vec![
            status_event("cs-inc", 2, Some("a")),
            status_event("cs-inc", 3, Some("b")),
            status_event("cs-inc", 4, Some("c")),
        ],
    )
    .await;

    let (status, version) = provider.get_custom_status("cs-inc", 0).await.unwrap().unwrap();
    assert_eq!(status.as_deref(), Some("c"));
    assert_eq!(version, 3);
}

/// Asking with the current version returns nothing.
pub async fn test_custom_status_polling_no_change<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-poll").await.unwrap();
    ack_turn(&*provider, "cs-poll", 1, vec![status_event("cs-poll", 2, Some("x"))]).await;

    assert!(provider.get_custom_status("cs-poll", 1).await.unwrap().is_none());
    assert!(provider.get_custom_status("cs-poll", 5).await.unwrap().is_none());
    assert!(provider.get_custom_status("cs-poll", 0).await.unwrap().is_some());
}

pub async fn test_custom_status_nonexistent_instance<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    assert!(provider.get_custom_status("cs-missing", 0).await.unwrap().is_none());
}

/// A new instance starts at version 0 with no value.
pub async fn test_custom_status_default_on_new_instance<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-new").await.unwrap();

    assert!(provider.get_custom_status("cs-new", 0).await.unwrap().is_none());
    let info = provider.get_instance_info("cs-new").await.unwrap().unwrap();
    assert_eq!(info.custom_status, None);
    assert_eq!(info.custom_status_version, 0);
}

/// Custom status lives on the instance and survives continue-as-new.
pub async fn test_custom_status_survives_new_execution<F: ProviderFactory>(factory: &F) {
    let provider = factory.create_provider().await;
    create_instance(&*provider, "cs-can").await.unwrap();
    ack_turn(&*provider, "cs-can", 1, vec![status_event("cs-can", 2, Some("epoch-1"))]).await;

    ack_turn(
        &*provider,
        "cs-can",
        2,
        vec![crate::provider_validation::started_event("cs-can", 2)],
    )
    .await;

    assert_eq!(provider.latest_execution_id("cs-can").await.unwrap(), Some(2));
    let (status, version) = provider.get_custom_status("cs-can", 0).await.unwrap().unwrap();
    assert_eq!(status.as_deref(), Some("epoch-1"));
    assert_eq!(version, 1);
}
