//! Storage contract for the runtime.
//!
//! A provider owns four things: per-instance history (append-only, ordered by
//! `event_id` within an execution), the orchestrator queue (with delayed
//! visibility, used for timers), the worker queue (activities, with session
//! affinity), and the instance row holding status and the versioned custom
//! status. Every mutating call is atomic.

use crate::{ErrorDetails, Event, EventKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::ProviderError;

/// Messages exchanged through the provider queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        session_id: Option<String>,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    QueueMessage {
        instance: String,
        queue: String,
        data: String,
    },
    /// Starts the next execution. `carry_forward` holds unread queue items as `(queue, data)`.
    ContinueAsNew {
        instance: String,
        orchestration: String,
        version: String,
        input: String,
        carry_forward: Vec<(String, String)>,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::QueueMessage { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::QueueMessage { .. } => "QueueMessage",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }

    /// Session tag of an activity item.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            WorkItem::ActivityExecute { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

/// Locked batch handed to the orchestration dispatcher.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub orchestration_name: String,
    pub version: String,
    /// Current execution id; `INITIAL_EXECUTION_ID` for brand new instances.
    pub execution_id: u64,
    /// History of the current execution.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
}

/// Instance-level facts computed by the runtime and applied by the provider in the same
/// transaction as the history append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    /// `Running`, `Completed`, `Failed` or `ContinuedAsNew` for the acked execution.
    pub status: Option<String>,
    pub output: Option<String>,
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
}

/// Activity addressed for cancellation (its worker-queue row is deleted).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduledActivityIdentifier {
    pub instance: String,
    pub execution_id: u64,
    pub activity_id: u64,
}

/// Session affinity parameters for `fetch_work_item`.
#[derive(Debug, Clone)]
pub struct SessionFetchConfig {
    /// Identity recorded as the session owner.
    pub owner_id: String,
    /// Session lease length granted on claim.
    pub lock_timeout: Duration,
    /// Whether an unowned (or expired) session may be claimed by this fetch.
    pub can_claim_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub orchestration_version: String,
    pub current_execution_id: u64,
    /// `Running`, `Completed` or `Failed`.
    pub status: String,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub custom_status_version: u64,
}

/// Count of `CustomStatusSet` events and the final value in a history delta.
pub(crate) fn custom_status_updates(history_delta: &[Event]) -> Option<(Option<String>, u64)> {
    let mut last = None;
    let mut count = 0u64;
    for e in history_delta {
        if let EventKind::CustomStatusSet { status } = &e.kind {
            last = Some(status.clone());
            count += 1;
        }
    }
    last.map(|status| (status, count))
}

/// Storage backend contract.
///
/// # Orchestrator queue
/// `fetch_orchestration_item` picks the instance with the oldest visible message that
/// is not locked, locks it, and returns every visible message for it together with the
/// current execution's history. `ack_orchestration_item` commits one turn atomically.
///
/// # Worker queue and sessions
/// `fetch_work_item` never returns a session item unless it is the oldest item of its
/// session and no item of that session is locked; this is what serializes a session.
/// A session owned by another `owner_id` with an unexpired lease is not fetchable.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str {
        "unknown"
    }

    // ---- orchestrator side ----

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError>;

    /// Commit a turn: append `history_delta` to `execution_id` (creating the execution if
    /// new), enqueue worker and orchestrator items, apply `metadata` and custom-status
    /// updates, delete the worker rows in `cancelled_activities`, remove the fetched
    /// messages and release the instance lock.
    ///
    /// Events whose `event_id` is not above the last stored one are skipped, so
    /// re-acking an already committed delta is a no-op.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
        cancelled_activities: Vec<ScheduledActivityIdentifier>,
    ) -> Result<(), ProviderError>;

    /// Release the lock without consuming messages; they become visible after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    /// Enqueue for the orchestration dispatcher, visible after `delay`.
    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;

    // ---- worker side ----

    /// Fetch one activity. With `session == None` only non-session items are returned.
    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
        session: Option<&SessionFetchConfig>,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete the locked item and enqueue `completion` atomically. Fails if the lock was
    /// lost or the item was cancelled.
    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Fails once the item has been deleted (cancelled) or its lock was taken over.
    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    /// Extend the lease of the listed sessions still owned by `owner_id`. Returns how many
    /// were renewed.
    async fn renew_session_lock(
        &self,
        owner_id: &str,
        session_ids: &[String],
        extend_for: Duration,
    ) -> Result<usize, ProviderError>;

    /// Give up ownership of an idle session. Returns false (and keeps it) if the session
    /// still has queued items or belongs to someone else.
    async fn release_session(&self, owner_id: &str, session_id: &str) -> Result<bool, ProviderError>;

    /// Remove expired sessions that have no queued items.
    async fn cleanup_orphaned_sessions(&self) -> Result<usize, ProviderError>;

    // ---- reads ----

    /// History of the latest execution.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// `Some((status, version))` when the stored version is above `since_version`.
    async fn get_custom_status(
        &self,
        instance: &str,
        since_version: u64,
    ) -> Result<Option<(Option<String>, u64)>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;
}
