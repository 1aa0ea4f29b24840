//! Durable execution for Rust.
//!
//! Orchestrations are ordinary `async` functions over an [`OrchestrationContext`].
//! Every side effect they request (activities, timers, signals, queue reads,
//! status updates) is recorded as an [`Event`] in a per-instance history, and the
//! function is replayed against that history on every turn. Identical code and
//! history always produce identical commands, so an instance survives process
//! restarts and worker failures.
//!
//! ```rust,no_run
//! use duralane::providers::in_memory::InMemoryProvider;
//! use duralane::runtime::registry::ActivityRegistry;
//! use duralane::runtime::{self, OrchestrationRegistry};
//! use duralane::{ActivityContext, Client, OrchestrationContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let store = Arc::new(InMemoryProvider::new());
//! let activities = ActivityRegistry::builder()
//!     .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(format!("echo:{input}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("Hello", |ctx: OrchestrationContext, input: String| async move {
//!         ctx.schedule_activity_on_session("Echo", input, "s1").await
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
//! let client = Client::new(store);
//! client.start_orchestration("inst-1", "Hello", "hi").await.unwrap();
//! let status = client.wait_for_orchestration("inst-1", Duration::from_secs(5)).await.unwrap();
//! println!("{status:?}");
//! rt.shutdown(None).await;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

pub mod _typed_codec;
pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

#[cfg(feature = "provider-test")]
pub mod provider_validation;
#[cfg(feature = "provider-test")]
pub mod provider_validations;

pub use client::{Client, ClientError};
pub use crate::futures::{DurableFuture, DurableOutput, RaceResult, Task, TaskResult};
pub use providers::{Provider, ProviderError};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions, WaitError};

use crate::_typed_codec::{Codec, Json};
use crate::runtime::mailbox::{Mailbox, MailboxKey};

/// First execution of every instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;
/// Event ids restart at this value in every execution.
pub const INITIAL_EVENT_ID: u64 = 1;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    OrchestrationFailed,
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    /// Replay diverged from recorded history.
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
}

/// Structured failure stored in history.
///
/// Only `Application` errors are visible to orchestration code (as a rejected
/// activity). `Configuration` errors fail the instance. `Infrastructure` errors
/// come from the provider and are retried by the dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Application { retryable, .. } | ErrorDetails::Infrastructure { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
        }
    }

    /// Flat message surfaced to orchestration code and clients.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                message,
                ..
            } => format!("nondeterministic: {}", message.as_deref().unwrap_or("history mismatch")),
            ErrorDetails::Configuration { resource, .. } => format!("unregistered:{resource}"),
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

// ============================================================================
// History
// ============================================================================

/// One entry in an instance's history.
///
/// `event_id` is the per-execution sequence number. Completion events carry the
/// `event_id` of the schedule event they answer in `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub source_event_id: Option<u64>,
    pub instance_id: String,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
    },
    ActivityScheduled {
        name: String,
        input: String,
        session_id: Option<String>,
    },
    ActivityCompleted {
        result: String,
    },
    ActivityFailed {
        details: ErrorDetails,
    },
    TimerCreated {
        delay_ms: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        name: String,
    },
    EventRaised {
        name: String,
        data: String,
    },
    QueueSubscribed {
        queue: String,
    },
    EventEnqueued {
        queue: String,
        data: String,
    },
    CustomStatusSet {
        status: Option<String>,
    },
    OrchestrationContinuedAsNew {
        input: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: ErrorDetails,
    },
}

impl EventKind {
    /// Events produced by orchestration commands, matched against emitted actions on replay.
    pub fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::ExternalSubscribed { .. }
                | EventKind::QueueSubscribed { .. }
                | EventKind::CustomStatusSet { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationContinuedAsNew { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::QueueSubscribed { .. } => "QueueSubscribed",
            EventKind::EventEnqueued { .. } => "EventEnqueued",
            EventKind::CustomStatusSet { .. } => "CustomStatusSet",
            EventKind::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
        }
    }
}

impl Event {
    pub fn with_event_id(
        event_id: u64,
        instance_id: impl Into<String>,
        execution_id: u64,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id,
            source_event_id,
            instance_id: instance_id.into(),
            execution_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

/// Command emitted by orchestration code, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        name: String,
        input: String,
        session_id: Option<String>,
    },
    CreateTimer {
        delay_ms: u64,
    },
    WaitExternal {
        name: String,
    },
    DequeueEvent {
        queue: String,
    },
    SetCustomStatus {
        status: Option<String>,
    },
}

impl Action {
    /// Whether `kind` is the history record of this action.
    pub(crate) fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (
                Action::CallActivity { name, input, session_id },
                EventKind::ActivityScheduled {
                    name: n,
                    input: i,
                    session_id: s,
                },
            ) => name == n && input == i && session_id == s,
            (Action::CreateTimer { delay_ms }, EventKind::TimerCreated { delay_ms: d, .. }) => delay_ms == d,
            (Action::WaitExternal { name }, EventKind::ExternalSubscribed { name: n }) => name == n,
            (Action::DequeueEvent { queue }, EventKind::QueueSubscribed { queue: q }) => queue == q,
            (Action::SetCustomStatus { status }, EventKind::CustomStatusSet { status: s }) => status == s,
            _ => false,
        }
    }

    /// History record for a newly issued action.
    pub(crate) fn to_event_kind(&self, now_ms: u64) -> EventKind {
        match self {
            Action::CallActivity { name, input, session_id } => EventKind::ActivityScheduled {
                name: name.clone(),
                input: input.clone(),
                session_id: session_id.clone(),
            },
            Action::CreateTimer { delay_ms } => EventKind::TimerCreated {
                delay_ms: *delay_ms,
                fire_at_ms: now_ms.saturating_add(*delay_ms),
            },
            Action::WaitExternal { name } => EventKind::ExternalSubscribed { name: name.clone() },
            Action::DequeueEvent { queue } => EventKind::QueueSubscribed { queue: queue.clone() },
            Action::SetCustomStatus { status } => EventKind::CustomStatusSet { status: status.clone() },
        }
    }
}

// ============================================================================
// Orchestration context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Activity,
    Timer,
    Signal,
    Queue,
    Status,
}

#[derive(Debug)]
pub(crate) struct EmittedAction {
    pub(crate) token: u64,
    pub(crate) kind: TaskKind,
    pub(crate) action: Action,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) orchestration_name: String,
    pub(crate) orchestration_version: String,
    pub(crate) is_replaying: bool,
    next_token: u64,
    emitted: VecDeque<EmittedAction>,
    // token -> schedule event id
    bindings: HashMap<u64, u64>,
    // schedule event id -> (token, kind)
    schedules: HashMap<u64, (u64, TaskKind)>,
    // schedule event id -> resolved output
    results: HashMap<u64, DurableOutput>,
    cancelled_tokens: HashSet<u64>,
    cancelled_activities: BTreeSet<u64>,
    mailbox: Mailbox,
    continue_as_new: Option<String>,
}

/// Outcome of delivering a completion event to the context.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Resolved,
    Duplicate,
    UnknownSource,
    KindMismatch(TaskKind),
}

impl CtxInner {
    fn emit(&mut self, kind: TaskKind, action: Action) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.emitted.push_back(EmittedAction { token, kind, action });
        token
    }

    fn resolve(&mut self, schedule_id: u64, output: DurableOutput) {
        self.results.insert(schedule_id, output);
    }

    /// Mark a task as cancelled. Queue and signal claims are released so the payload is not lost.
    fn cancel(&mut self, token: u64, kind: TaskKind) {
        if !self.cancelled_tokens.insert(token) {
            return;
        }
        let Some(&schedule_id) = self.bindings.get(&token) else {
            return;
        };
        match kind {
            TaskKind::Activity => {
                if !self.results.contains_key(&schedule_id) {
                    self.cancelled_activities.insert(schedule_id);
                }
            }
            TaskKind::Signal | TaskKind::Queue => {
                self.results.remove(&schedule_id);
                if let Some((next, data)) = self.mailbox.release(schedule_id) {
                    self.resolve(next, DurableOutput::Event(data));
                }
            }
            TaskKind::Timer | TaskKind::Status => {}
        }
    }
}

/// Handle given to orchestration code. Cheap to clone; all clones share one turn's state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance_id: impl Into<String>,
        execution_id: u64,
        orchestration_name: impl Into<String>,
        orchestration_version: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance_id: instance_id.into(),
                execution_id,
                orchestration_name: orchestration_name.into(),
                orchestration_version: orchestration_version.into(),
                is_replaying: true,
                next_token: 0,
                emitted: VecDeque::new(),
                bindings: HashMap::new(),
                schedules: HashMap::new(),
                results: HashMap::new(),
                cancelled_tokens: HashSet::new(),
                cancelled_activities: BTreeSet::new(),
                mailbox: Mailbox::default(),
                continue_as_new: None,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // Orchestration panics are caught by the engine; keep using the state after a poisoned poll.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    pub fn orchestration_version(&self) -> String {
        self.lock().orchestration_version.clone()
    }

    /// True while the engine is re-executing code against recorded history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    fn task<T>(&self, kind: TaskKind, action: Action) -> DurableFuture<T> {
        let token = self.lock().emit(kind, action);
        DurableFuture::new(Task::new(token, kind, self.clone()))
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture<Result<String, String>> {
        self.task(
            TaskKind::Activity,
            Action::CallActivity {
                name: name.into(),
                input: input.into(),
                session_id: None,
            },
        )
    }

    /// Schedule an activity on a session lane. Activities sharing `session_id` run one at a
    /// time, in scheduling order, on whichever worker currently owns the session.
    pub fn schedule_activity_on_session(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        session_id: impl Into<String>,
    ) -> DurableFuture<Result<String, String>> {
        self.task(
            TaskKind::Activity,
            Action::CallActivity {
                name: name.into(),
                input: input.into(),
                session_id: Some(session_id.into()),
            },
        )
    }

    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl std::future::Future<Output = Result<Out, String>> + Send
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let scheduled = Json::encode(input).map(|payload| self.schedule_activity(name, payload));
        async move { Json::decode(&scheduled?.await?) }
    }

    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture<()> {
        self.task(
            TaskKind::Timer,
            Action::CreateTimer {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    /// Wait for a single external signal raised with `Client::raise_event`.
    pub fn wait_for_event(&self, name: impl Into<String>) -> DurableFuture<String> {
        self.task(TaskKind::Signal, Action::WaitExternal { name: name.into() })
    }

    pub fn wait_for_event_typed<T: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
    ) -> impl std::future::Future<Output = Result<T, String>> + Send {
        let fut = self.wait_for_event(name);
        async move { Json::decode(&fut.await) }
    }

    /// Take the next item from a durable queue fed by `Client::enqueue_event`.
    pub fn dequeue_event(&self, queue: impl Into<String>) -> DurableFuture<String> {
        self.task(TaskKind::Queue, Action::DequeueEvent { queue: queue.into() })
    }

    pub fn dequeue_event_typed<T: serde::de::DeserializeOwned>(
        &self,
        queue: impl Into<String>,
    ) -> impl std::future::Future<Output = Result<T, String>> + Send {
        let fut = self.dequeue_event(queue);
        async move { Json::decode(&fut.await) }
    }

    /// Wait for every task; outcomes come back in input order.
    pub fn all(&self, tasks: Vec<Task>) -> crate::futures::JoinFuture {
        crate::futures::JoinFuture::new(tasks)
    }

    /// Resolve with the first task to finish; the others are cancelled.
    pub fn race(&self, tasks: Vec<Task>) -> crate::futures::RaceFuture {
        crate::futures::RaceFuture::new(tasks)
    }

    /// Replace the instance's custom status. Each call bumps the status version.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().emit(
            TaskKind::Status,
            Action::SetCustomStatus {
                status: Some(status.into()),
            },
        );
    }

    pub fn reset_custom_status(&self) {
        self.lock().emit(TaskKind::Status, Action::SetCustomStatus { status: None });
    }

    /// End this execution and start a fresh one with `input`. Unread queue items and the
    /// custom status carry over; pending `wait_for_event` subscriptions do not.
    ///
    /// The returned future never resolves.
    pub fn continue_as_new(&self, input: impl Into<String>) -> crate::futures::ContinueAsNewFuture {
        let mut inner = self.lock();
        if inner.continue_as_new.is_none() {
            inner.continue_as_new = Some(input.into());
        }
        crate::futures::ContinueAsNewFuture
    }

    // ------------------------------------------------------------------
    // Engine-facing state transitions
    // ------------------------------------------------------------------

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.lock().is_replaying = replaying;
    }

    pub(crate) fn pop_emitted(&self) -> Option<EmittedAction> {
        self.lock().emitted.pop_front()
    }

    pub(crate) fn drain_emitted(&self) -> Vec<EmittedAction> {
        self.lock().emitted.drain(..).collect()
    }

    pub(crate) fn take_continue_as_new(&self) -> Option<String> {
        self.lock().continue_as_new.take()
    }

    pub(crate) fn is_cancelled(&self, token: u64) -> bool {
        self.lock().cancelled_tokens.contains(&token)
    }

    /// Bind an emitted action to its schedule event. Returns true if the binding resolved the task.
    pub(crate) fn bind(&self, emitted: &EmittedAction, schedule_id: u64) -> bool {
        let mut inner = self.lock();
        inner.bindings.insert(emitted.token, schedule_id);
        inner.schedules.insert(schedule_id, (emitted.token, emitted.kind));
        let cancelled = inner.cancelled_tokens.contains(&emitted.token);
        let key = match &emitted.action {
            Action::WaitExternal { name } => MailboxKey::Signal(name.clone()),
            Action::DequeueEvent { queue } => MailboxKey::Queue(queue.clone()),
            Action::CallActivity { .. } => {
                if cancelled {
                    inner.cancelled_activities.insert(schedule_id);
                }
                return false;
            }
            _ => return false,
        };
        if cancelled {
            return false;
        }
        match inner.mailbox.subscribe(key, schedule_id) {
            Some(data) => {
                inner.resolve(schedule_id, DurableOutput::Event(data));
                true
            }
            None => false,
        }
    }

    pub(crate) fn deliver_completion(&self, source_event_id: u64, output: DurableOutput) -> Delivery {
        let mut inner = self.lock();
        let Some(&(_, kind)) = inner.schedules.get(&source_event_id) else {
            return Delivery::UnknownSource;
        };
        let expected = match &output {
            DurableOutput::Activity(_) => TaskKind::Activity,
            DurableOutput::Timer => TaskKind::Timer,
            DurableOutput::Event(_) => TaskKind::Signal,
        };
        if expected != kind {
            return Delivery::KindMismatch(kind);
        }
        if inner.results.contains_key(&source_event_id) {
            return Delivery::Duplicate;
        }
        inner.cancelled_activities.remove(&source_event_id);
        inner.resolve(source_event_id, output);
        Delivery::Resolved
    }

    /// Deliver a raised signal or enqueued item. Returns true if a subscription took it.
    pub(crate) fn deliver_arrival(&self, key: MailboxKey, arrival_id: u64, data: String) -> bool {
        let mut inner = self.lock();
        match inner.mailbox.arrive(key, arrival_id, data) {
            Some((schedule_id, data)) => {
                inner.resolve(schedule_id, DurableOutput::Event(data));
                true
            }
            None => false,
        }
    }

    pub(crate) fn unclaimed_queue_items(&self) -> Vec<(String, String)> {
        self.lock().mailbox.unclaimed_queue_items()
    }

    pub(crate) fn cancelled_activities(&self) -> Vec<u64> {
        self.lock().cancelled_activities.iter().copied().collect()
    }

    pub(crate) fn poll_task(&self, token: u64) -> Option<DurableOutput> {
        let inner = self.lock();
        let schedule_id = inner.bindings.get(&token)?;
        inner.results.get(schedule_id).cloned()
    }

    pub(crate) fn cancel_task(&self, token: u64, kind: TaskKind) {
        self.lock().cancel(token, kind);
    }
}

// ============================================================================
// Activity context
// ============================================================================

/// Context passed to activity handlers.
#[derive(Clone, Debug)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    activity_name: String,
    activity_id: u64,
    session_id: Option<String>,
    worker_id: String,
    cancellation: CancellationToken,
}

impl ActivityContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        orchestration_name: String,
        activity_name: String,
        activity_id: u64,
        session_id: Option<String>,
        worker_id: String,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            orchestration_name,
            activity_name,
            activity_id,
            session_id,
            worker_id,
            cancellation,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    /// Session this activity was scheduled on, `None` for plain activities.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Label of the worker executing this attempt.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once the awaiting task was cancelled (lost a race) or this worker lost its lease.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when [`is_cancelled`](Self::is_cancelled) becomes true.
    ///
    /// Cancellation is discovered through the lease, so it arrives up to
    /// `RuntimeOptions::activity_cancellation_check_interval` after the orchestration
    /// cancelled the task.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "duralane::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "duralane::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json_with_flattened_kind() {
        let ev = Event::with_event_id(
            3,
            "inst",
            2,
            Some(2),
            EventKind::ActivityFailed {
                details: ErrorDetails::Application {
                    kind: AppErrorKind::ActivityFailed,
                    message: "boom".into(),
                    retryable: false,
                },
            },
        );
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"ActivityFailed""#), "{json}");
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn action_matching_is_strict_on_payload() {
        let a = Action::CallActivity {
            name: "Echo".into(),
            input: "hello".into(),
            session_id: Some("s".into()),
        };
        let same = EventKind::ActivityScheduled {
            name: "Echo".into(),
            input: "hello".into(),
            session_id: Some("s".into()),
        };
        let other_session = EventKind::ActivityScheduled {
            name: "Echo".into(),
            input: "hello".into(),
            session_id: None,
        };
        assert!(a.matches(&same));
        assert!(!a.matches(&other_session));
        assert!(!Action::CreateTimer { delay_ms: 5 }.matches(&EventKind::TimerCreated {
            delay_ms: 6,
            fire_at_ms: 0
        }));
    }

    #[test]
    fn display_message_by_category() {
        let unreg = ErrorDetails::Configuration {
            kind: ConfigErrorKind::UnregisteredActivity,
            resource: "Missing".into(),
            message: None,
        };
        assert_eq!(unreg.display_message(), "unregistered:Missing");
        assert!(!unreg.is_retryable());
        let nd = ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: "Flow".into(),
            message: Some("expected timer".into()),
        };
        assert_eq!(nd.display_message(), "nondeterministic: expected timer");
        assert_eq!(nd.category(), "configuration");
    }

    #[test]
    fn cancelling_claimed_queue_task_restores_item() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let first = ctx.dequeue_event("q").into_task();
        let emitted = ctx.pop_emitted().unwrap();
        assert!(!ctx.deliver_arrival(MailboxKey::Queue("q".into()), 2, "m1".into()));
        assert!(ctx.bind(&emitted, 3));
        assert_eq!(ctx.poll_task(first.token()), Some(DurableOutput::Event("m1".into())));
        ctx.cancel_task(first.token(), TaskKind::Queue);
        assert_eq!(ctx.poll_task(first.token()), None);
        assert_eq!(ctx.unclaimed_queue_items(), vec![("q".to_string(), "m1".to_string())]);
    }
}
