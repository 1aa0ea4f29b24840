//! Fault injection providers for testing how the runtime copes with storage errors.

// Only some test files that import common use these.
#![allow(dead_code)]

use async_trait::async_trait;
use duralane::Event;
use duralane::providers::error::ProviderError;
use duralane::providers::{
    ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, ScheduledActivityIdentifier, SessionFetchConfig,
    WorkItem,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Wraps a provider and makes the next N `ack_orchestration_item` calls fail with a
/// retryable error, as an unavailable database would.
pub struct FlakyAckProvider {
    inner: Arc<dyn Provider>,
    failures_left: AtomicU32,
    failed: AtomicU32,
    abandoned: AtomicU32,
}

impl FlakyAckProvider {
    pub fn new(inner: Arc<dyn Provider>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            failed: AtomicU32::new(0),
            abandoned: AtomicU32::new(0),
        }
    }

    /// Acks rejected so far.
    pub fn failed_acks(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Orchestration items handed back through `abandon_orchestration_item`.
    pub fn abandoned(&self) -> u32 {
        self.abandoned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FlakyAckProvider {
    fn name(&self) -> &str {
        "flaky-ack"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        self.inner.fetch_orchestration_item(lock_timeout).await
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
        cancelled_activities: Vec<ScheduledActivityIdentifier>,
    ) -> Result<(), ProviderError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::retryable("ack_orchestration_item", "database is locked"));
        }
        self.inner
            .ack_orchestration_item(
                lock_token,
                execution_id,
                history_delta,
                worker_items,
                orchestrator_items,
                metadata,
                cancelled_activities,
            )
            .await
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        self.inner.abandon_orchestration_item(lock_token, delay).await
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        self.inner.renew_orchestration_item_lock(lock_token, extend_for).await
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.enqueue_for_orchestrator(item, delay).await
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
        session: Option<&SessionFetchConfig>,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.fetch_work_item(lock_timeout, session).await
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        self.inner.ack_work_item(lock_token, completion).await
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.abandon_work_item(lock_token, delay).await
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        self.inner.renew_work_item_lock(lock_token, extend_for).await
    }

    async fn renew_session_lock(
        &self,
        owner_id: &str,
        session_ids: &[String],
        extend_for: Duration,
    ) -> Result<usize, ProviderError> {
        self.inner.renew_session_lock(owner_id, session_ids, extend_for).await
    }

    async fn release_session(&self, owner_id: &str, session_id: &str) -> Result<bool, ProviderError> {
        self.inner.release_session(owner_id, session_id).await
    }

    async fn cleanup_orphaned_sessions(&self) -> Result<usize, ProviderError> {
        self.inner.cleanup_orphaned_sessions().await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read(instance).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_with_execution(instance, execution_id).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        self.inner.latest_execution_id(instance).await
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        self.inner.get_instance_info(instance).await
    }

    async fn get_custom_status(
        &self,
        instance: &str,
        since_version: u64,
    ) -> Result<Option<(Option<String>, u64)>, ProviderError> {
        self.inner.get_custom_status(instance, since_version).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}
