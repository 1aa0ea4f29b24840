//! Provider Validation Tests
//!
//! Test suite for validating provider implementations.
//! These tests are designed to work with any provider through the `ProviderFactory` trait.

pub mod atomicity;
pub mod cancellation;
pub mod custom_status;
pub mod instance_locking;
pub mod lock_expiration;
pub mod multi_execution;
pub mod queue_semantics;
pub mod sessions;

use crate::INITIAL_EXECUTION_ID;
use crate::providers::{Provider, SessionFetchConfig, WorkItem};
use std::time::Duration;

pub use crate::providers::ExecutionMetadata;
/// Re-export common types for use in test modules
pub use crate::{Event, EventKind};

/// Helper function to create a start item for an instance
pub(crate) fn start_item(instance: &str) -> WorkItem {
    WorkItem::StartOrchestration {
        instance: instance.to_string(),
        orchestration: "TestOrch".to_string(),
        version: Some("1.0.0".to_string()),
        input: "{}".to_string(),
    }
}

/// A signal used only to make the instance fetchable again.
pub(crate) fn poke_item(instance: &str) -> WorkItem {
    WorkItem::ExternalRaised {
        instance: instance.to_string(),
        name: "poke".to_string(),
        data: "{}".to_string(),
    }
}

pub(crate) fn activity_item(instance: &str, id: u64, session_id: Option<&str>) -> WorkItem {
    WorkItem::ActivityExecute {
        instance: instance.to_string(),
        execution_id: INITIAL_EXECUTION_ID,
        id,
        name: "TestActivity".to_string(),
        input: format!("input-{id}"),
        session_id: session_id.map(str::to_string),
    }
}

pub(crate) fn session_config(owner_id: &str, can_claim_new: bool) -> SessionFetchConfig {
    SessionFetchConfig {
        owner_id: owner_id.to_string(),
        lock_timeout: Duration::from_secs(30),
        can_claim_new,
    }
}

pub(crate) fn started_event(instance: &str, execution_id: u64) -> Event {
    Event::with_event_id(
        crate::INITIAL_EVENT_ID,
        instance,
        execution_id,
        None,
        EventKind::OrchestrationStarted {
            name: "TestOrch".to_string(),
            version: "1.0.0".to_string(),
            input: "{}".to_string(),
        },
    )
}

pub(crate) fn test_metadata() -> ExecutionMetadata {
    ExecutionMetadata {
        orchestration_name: Some("TestOrch".to_string()),
        orchestration_version: Some("1.0.0".to_string()),
        ..Default::default()
    }
}

/// Helper function to create an instance by enqueueing, fetching, and acking with metadata
pub(crate) async fn create_instance(provider: &dyn Provider, instance: &str) -> Result<(), String> {
    create_instance_with_work(provider, instance, vec![]).await
}

/// Like [`create_instance`], also scheduling `worker_items` in the first turn.
pub(crate) async fn create_instance_with_work(
    provider: &dyn Provider,
    instance: &str,
    worker_items: Vec<WorkItem>,
) -> Result<(), String> {
    provider
        .enqueue_for_orchestrator(start_item(instance), None)
        .await
        .map_err(|e| e.to_string())?;

    let (_, lock_token) = provider
        .fetch_orchestration_item(Duration::from_secs(30))
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "Failed to fetch orchestration item".to_string())?;

    provider
        .ack_orchestration_item(
            &lock_token,
            INITIAL_EXECUTION_ID,
            vec![started_event(instance, INITIAL_EXECUTION_ID)],
            worker_items,
            vec![],
            test_metadata(),
            vec![],
        )
        .await
        .map_err(|e| e.to_string())?;

    Ok(())
}
