//! Provider Validation Infrastructure
//!
//! This module provides reusable test infrastructure for validating custom Provider implementations.
//! Enable the `provider-test` feature to use these utilities.
//!
//! # Example
//!
//! ```rust,ignore
//! use duralane::providers::Provider;
//! use duralane::provider_validations::ProviderFactory;
//! use std::sync::Arc;
//!
//! struct MyProviderFactory;
//!
//! #[async_trait::async_trait]
//! impl ProviderFactory for MyProviderFactory {
//!     async fn create_provider(&self) -> Arc<dyn Provider> {
//!         Arc::new(MyProvider::new().await.unwrap())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn test_my_provider() {
//!     let factory = MyProviderFactory;
//!     duralane::provider_validations::test_atomicity_failure_rollback(&factory).await;
//! }
//! ```

use crate::providers::Provider;
use std::sync::Arc;
use std::time::Duration;

/// Trait for creating providers in tests.
///
/// Implement this trait to provide a way to create your custom provider instance
/// for validation testing.
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Create a new provider instance for testing.
    ///
    /// Each call should return a fresh, isolated provider instance.
    async fn create_provider(&self) -> Arc<dyn Provider>;

    /// Lock (and session lease) length the expiration tests wait out.
    ///
    /// Returns 1 second if not overridden.
    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(1000)
    }
}

/// ## Individual Test Functions
///
/// **Atomicity:** a rejected ack changes nothing; a full turn commits as one unit;
/// the lock is released only by a successful ack; concurrent acks with one token have
/// one winner; appends are idempotent by event id.
///
/// **Instance locking:** exclusive instance locks, unique tokens, rejection of unknown
/// tokens, messages arriving during a lock wait for the next fetch, cross-instance
/// isolation, delayed abandon, no duplicate processing under contention.
///
/// **Lock expiration:** orchestration and worker locks expire, can be abandoned, and
/// can be renewed; stale tokens are rejected.
///
/// **Queue semantics:** worker FIFO, peek-lock, atomic worker ack, timer and delayed
/// visibility, redelivery after a lost lock, batch ordering.
///
/// **Multi-execution:** continue-as-new opens a new execution with its own history;
/// reads follow the latest execution.
///
/// **Custom status:** set, clear, preserve, per-event version increments, polling
/// with `since_version`, survival across executions.
///
/// **Sessions:** affinity, head-of-line ordering, claim capacity, expiry takeover,
/// owner-only renewal, release and orphan cleanup.
///
/// **Cancellation:** cancelled activities disappear from the worker queue; running
/// workers see renew and ack fail.
pub use crate::provider_validation::atomicity::{
    test_append_is_idempotent_by_event_id, test_atomicity_failure_rollback, test_concurrent_ack_prevention,
    test_lock_released_only_on_successful_ack, test_multi_operation_atomic_ack,
};

pub use crate::provider_validation::instance_locking::{
    test_abandon_with_delay, test_completions_arriving_during_lock_blocked, test_cross_instance_lock_isolation,
    test_exclusive_instance_lock, test_invalid_lock_token_rejection, test_lock_token_uniqueness,
    test_multi_threaded_no_duplicate_processing,
};

pub use crate::provider_validation::lock_expiration::{
    test_abandon_releases_lock_immediately, test_lock_expires_after_timeout,
    test_orchestration_lock_renewal_extends_timeout, test_worker_lock_renewal_after_ack,
    test_worker_lock_renewal_after_expiration, test_worker_lock_renewal_extends_timeout,
    test_worker_lock_renewal_invalid_token, test_worker_lock_renewal_success,
};

pub use crate::provider_validation::multi_execution::{
    test_continue_as_new_carries_queue_items, test_execution_history_persistence, test_execution_isolation,
    test_latest_execution_detection,
};

pub use crate::provider_validation::queue_semantics::{
    test_delayed_enqueue_visibility, test_lost_lock_token_handling, test_orchestrator_batch_preserves_order,
    test_timer_delayed_visibility, test_worker_ack_atomicity, test_worker_peek_lock_semantics,
    test_worker_queue_fifo_ordering,
};

pub use crate::provider_validation::custom_status::{
    test_custom_status_clear, test_custom_status_default_on_new_instance, test_custom_status_none_preserves,
    test_custom_status_nonexistent_instance, test_custom_status_polling_no_change, test_custom_status_set,
    test_custom_status_survives_new_execution, test_custom_status_version_increments,
};

pub use crate::provider_validation::sessions::{
    test_cleanup_orphaned_sessions, test_different_sessions_different_workers,
    test_non_session_items_fetchable_by_any_worker, test_none_session_skips_session_items, test_release_session,
    test_renew_session_lock_only_owner, test_session_affinity_blocks_other_worker,
    test_session_claim_requires_capacity, test_session_claimable_after_lock_expiry,
    test_session_items_processed_in_order,
};

pub use crate::provider_validation::cancellation::{
    test_ack_work_item_fails_when_entry_deleted, test_ack_work_item_none_deletes_without_enqueue,
    test_cancellation_does_not_touch_other_instances, test_cancelled_activities_deleted_from_worker_queue,
    test_cancelling_nonexistent_activities_is_idempotent, test_renew_fails_when_entry_deleted,
};
