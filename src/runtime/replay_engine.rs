//! Deterministic replay of one orchestration turn.
//!
//! The engine walks the execution's history (the stored baseline followed by the
//! events produced from this turn's messages) and drives the orchestration future
//! alongside it. The future is polled before an event only when something it may be
//! waiting on has resolved since the last poll; the same rule applies to stored and
//! new events and to the final append phase, so a replay observes exactly the poll
//! points of the original run.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::{debug, warn};

use super::OrchestrationHandler;
use super::mailbox::MailboxKey;
use crate::providers::WorkItem;
use crate::{
    Action, AppErrorKind, ConfigErrorKind, Delivery, DurableOutput, ErrorDetails, Event, EventKind, INITIAL_EVENT_ID,
    OrchestrationContext, now_ms,
};

/// Outcome of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// The orchestration is waiting on something.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    /// A fresh execution should start with `input`; `carry_forward` holds unread queue
    /// items as `(queue, data)` in arrival order.
    ContinueAsNew {
        input: String,
        carry_forward: Vec<(String, String)>,
    },
}

enum Outcome {
    Returned(Result<String, String>),
    Panicked(String),
    ContinueAsNew(String),
    Failed(ErrorDetails),
    Nondeterministic(String),
}

type OrchestrationFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

/// Poll once. `None` means the orchestration is still waiting.
fn poll_orchestration(fut: &mut OrchestrationFuture<'_>, ctx: &OrchestrationContext, replaying: bool) -> Option<Outcome> {
    ctx.set_replaying(replaying);
    let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
    let polled = catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));
    match polled {
        Err(payload) => Some(Outcome::Panicked(panic_message(payload))),
        Ok(Poll::Ready(_)) if replaying => Some(Outcome::Nondeterministic(
            "orchestration finished while replaying recorded history".to_string(),
        )),
        Ok(Poll::Ready(result)) => Some(Outcome::Returned(result)),
        Ok(Poll::Pending) => match ctx.take_continue_as_new() {
            Some(_) if replaying => Some(Outcome::Nondeterministic(
                "continue_as_new requested while replaying recorded history".to_string(),
            )),
            Some(input) => Some(Outcome::ContinueAsNew(input)),
            None => None,
        },
    }
}

pub struct ReplayEngine {
    instance: String,
    execution_id: u64,
    baseline: Vec<Event>,
    history_delta: Vec<Event>,
    worker_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    cancelled_activities: Vec<u64>,
    next_event_id: u64,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, execution_id: u64, baseline: Vec<Event>) -> Self {
        let next_event_id = baseline.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        Self {
            instance: instance.into(),
            execution_id,
            baseline,
            history_delta: Vec::new(),
            worker_items: Vec::new(),
            orchestrator_items: Vec::new(),
            cancelled_activities: Vec::new(),
            next_event_id,
        }
    }

    /// Append a new event to this turn's delta and return its id.
    pub fn push_event(&mut self, source_event_id: Option<u64>, kind: EventKind) -> u64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        self.history_delta.push(Event::with_event_id(
            event_id,
            self.instance.clone(),
            self.execution_id,
            source_event_id,
            kind,
        ));
        event_id
    }

    /// Schedule event recorded for `source`, searched in the baseline.
    fn scheduled_kind(&self, source: u64) -> Option<&EventKind> {
        self.baseline
            .iter()
            .find(|e| e.event_id == source && e.kind.is_schedule())
            .map(|e| &e.kind)
    }

    fn has_completion(&self, source: u64) -> bool {
        self.baseline
            .iter()
            .chain(self.history_delta.iter())
            .any(|e| e.source_event_id == Some(source))
    }

    /// Turn this batch's messages into history events.
    ///
    /// Completions addressed to another execution, to a schedule that does not exist,
    /// or to a schedule that already has a completion are dropped.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        for msg in messages {
            let (source, execution_id, kind) = match msg {
                WorkItem::ActivityCompleted {
                    execution_id, id, result, ..
                } => (*id, *execution_id, EventKind::ActivityCompleted { result: result.clone() }),
                WorkItem::ActivityFailed {
                    execution_id, id, details, ..
                } => (*id, *execution_id, EventKind::ActivityFailed { details: details.clone() }),
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => (*id, *execution_id, EventKind::TimerFired { fire_at_ms: *fire_at_ms }),
                WorkItem::ExternalRaised { name, data, .. } => {
                    self.push_event(
                        None,
                        EventKind::EventRaised {
                            name: name.clone(),
                            data: data.clone(),
                        },
                    );
                    continue;
                }
                WorkItem::QueueMessage { queue, data, .. } => {
                    self.push_event(
                        None,
                        EventKind::EventEnqueued {
                            queue: queue.clone(),
                            data: data.clone(),
                        },
                    );
                    continue;
                }
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => continue,
                WorkItem::ActivityExecute { .. } => {
                    warn!(instance_id = %self.instance, "Activity work item delivered to the orchestrator queue; dropping");
                    continue;
                }
            };

            if execution_id != self.execution_id {
                warn!(
                    instance_id = %self.instance,
                    execution_id = self.execution_id,
                    message_execution_id = execution_id,
                    kind = msg.kind(),
                    "Dropping completion for a different execution"
                );
                continue;
            }
            if self.scheduled_kind(source).is_none() {
                warn!(instance_id = %self.instance, source_event_id = source, kind = msg.kind(), "Dropping completion with unknown source");
                continue;
            }
            if self.has_completion(source) {
                debug!(instance_id = %self.instance, source_event_id = source, kind = msg.kind(), "Dropping duplicate completion");
                continue;
            }
            self.push_event(Some(source), kind);
        }
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    /// Activities scheduled this turn.
    pub fn pending_worker_items(&self) -> &[WorkItem] {
        &self.worker_items
    }

    /// Timers scheduled this turn.
    pub fn pending_orchestrator_items(&self) -> &[WorkItem] {
        &self.orchestrator_items
    }

    /// Schedule ids of activities whose awaiting task was cancelled before they completed.
    pub fn cancelled_activities(&self) -> &[u64] {
        &self.cancelled_activities
    }

    pub fn into_parts(self) -> (Vec<Event>, Vec<WorkItem>, Vec<WorkItem>, Vec<u64>) {
        (
            self.history_delta,
            self.worker_items,
            self.orchestrator_items,
            self.cancelled_activities,
        )
    }

    /// Run the orchestration against the full history of this execution.
    ///
    /// The first event (baseline or delta) must be `OrchestrationStarted`; its name,
    /// version and input seed the context.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
        let events: Vec<Event> = self.baseline.iter().chain(self.history_delta.iter()).cloned().collect();
        let Some((name, version, input)) = events.first().and_then(|e| match &e.kind {
            EventKind::OrchestrationStarted { name, version, input } => {
                Some((name.clone(), version.clone(), input.clone()))
            }
            _ => None,
        }) else {
            let details = ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                resource: self.instance.clone(),
                message: Some("history does not begin with OrchestrationStarted".to_string()),
            };
            self.push_event(None, EventKind::OrchestrationFailed { details: details.clone() });
            return TurnResult::Failed(details);
        };

        let ctx = OrchestrationContext::new(self.instance.clone(), self.execution_id, name, version);
        let mut fut: OrchestrationFuture<'_> = handler.invoke(ctx.clone(), input);
        let baseline_len = self.baseline.len();
        let mut must_poll = true;

        for (idx, event) in events.iter().enumerate().skip(1) {
            let replaying = idx < baseline_len;
            if must_poll {
                must_poll = false;
                if let Some(outcome) = poll_orchestration(&mut fut, &ctx, replaying) {
                    return self.conclude(&ctx, outcome, &events[idx..]);
                }
            }
            match self.apply_event(&ctx, event) {
                Ok(resolved) => must_poll = resolved,
                Err(outcome) => return self.conclude(&ctx, outcome, &[]),
            }
        }

        ctx.set_replaying(false);
        loop {
            if must_poll {
                must_poll = false;
                if let Some(outcome) = poll_orchestration(&mut fut, &ctx, false) {
                    return self.conclude(&ctx, outcome, &[]);
                }
            }
            let Some(emitted) = ctx.pop_emitted() else {
                break;
            };
            let kind = emitted.action.to_event_kind(now_ms());
            let fire_at_ms = match &kind {
                EventKind::TimerCreated { fire_at_ms, .. } => *fire_at_ms,
                _ => 0,
            };
            let event_id = self.push_event(None, kind);
            if !ctx.is_cancelled(emitted.token) {
                self.schedule_effect(event_id, &emitted.action, fire_at_ms);
            }
            must_poll = ctx.bind(&emitted, event_id);
        }

        self.cancelled_activities = ctx.cancelled_activities();
        TurnResult::Continue
    }

    fn schedule_effect(&mut self, event_id: u64, action: &Action, fire_at_ms: u64) {
        match action {
            Action::CallActivity { name, input, session_id } => self.worker_items.push(WorkItem::ActivityExecute {
                instance: self.instance.clone(),
                execution_id: self.execution_id,
                id: event_id,
                name: name.clone(),
                input: input.clone(),
                session_id: session_id.clone(),
            }),
            Action::CreateTimer { .. } => self.orchestrator_items.push(WorkItem::TimerFired {
                instance: self.instance.clone(),
                execution_id: self.execution_id,
                id: event_id,
                fire_at_ms,
            }),
            Action::WaitExternal { .. } | Action::DequeueEvent { .. } | Action::SetCustomStatus { .. } => {}
        }
    }

    /// Feed one event to the context. `Ok(true)` when a task resolved.
    fn apply_event(&self, ctx: &OrchestrationContext, event: &Event) -> Result<bool, Outcome> {
        if event.kind.is_schedule() {
            let Some(emitted) = ctx.pop_emitted() else {
                return Err(Outcome::Nondeterministic(format!(
                    "history has {} (event {}) but the orchestration issued no matching command",
                    event.kind.name(),
                    event.event_id
                )));
            };
            if !emitted.action.matches(&event.kind) {
                return Err(Outcome::Nondeterministic(format!(
                    "history has {} (event {}) but the orchestration issued {:?}",
                    event.kind.name(),
                    event.event_id,
                    emitted.action
                )));
            }
            return Ok(ctx.bind(&emitted, event.event_id));
        }

        let output = match &event.kind {
            EventKind::ActivityCompleted { result } => DurableOutput::Activity(Ok(result.clone())),
            EventKind::ActivityFailed {
                details: details @ ErrorDetails::Application { .. },
            } => DurableOutput::Activity(Err(details.display_message())),
            EventKind::ActivityFailed { details } => return Err(Outcome::Failed(details.clone())),
            EventKind::TimerFired { .. } => DurableOutput::Timer,
            EventKind::EventRaised { name, data } => {
                return Ok(ctx.deliver_arrival(MailboxKey::Signal(name.clone()), event.event_id, data.clone()));
            }
            EventKind::EventEnqueued { queue, data } => {
                return Ok(ctx.deliver_arrival(MailboxKey::Queue(queue.clone()), event.event_id, data.clone()));
            }
            other => {
                return Err(Outcome::Nondeterministic(format!(
                    "unexpected {} at event {}",
                    other.name(),
                    event.event_id
                )));
            }
        };

        let Some(source) = event.source_event_id else {
            return Err(Outcome::Nondeterministic(format!(
                "{} at event {} has no source event",
                event.kind.name(),
                event.event_id
            )));
        };
        match ctx.deliver_completion(source, output) {
            Delivery::Resolved => Ok(true),
            Delivery::Duplicate => Ok(false),
            Delivery::UnknownSource => {
                warn!(instance_id = %self.instance, source_event_id = source, "Ignoring completion with unknown source");
                Ok(false)
            }
            Delivery::KindMismatch(expected) => Err(Outcome::Nondeterministic(format!(
                "{} at event {} completes a {expected:?} schedule (event {source})",
                event.kind.name(),
                event.event_id
            ))),
        }
    }

    fn conclude(&mut self, ctx: &OrchestrationContext, outcome: Outcome, unprocessed: &[Event]) -> TurnResult {
        let pending = ctx.drain_emitted();
        self.cancelled_activities = ctx.cancelled_activities();

        if let Outcome::Nondeterministic(message) = outcome {
            warn!(instance_id = %self.instance, execution_id = self.execution_id, %message, "Nondeterminism detected");
            self.worker_items.clear();
            self.orchestrator_items.clear();
            let details = ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                resource: ctx.orchestration_name(),
                message: Some(message),
            };
            self.push_event(None, EventKind::OrchestrationFailed { details: details.clone() });
            return TurnResult::Failed(details);
        }

        for emitted in pending {
            if let Action::SetCustomStatus { .. } = &emitted.action {
                self.push_event(None, emitted.action.to_event_kind(now_ms()));
            }
        }

        let failed = |kind: AppErrorKind, message: String| ErrorDetails::Application {
            kind,
            message,
            retryable: false,
        };
        match outcome {
            Outcome::Returned(Ok(output)) => {
                self.push_event(None, EventKind::OrchestrationCompleted { output: output.clone() });
                TurnResult::Completed(output)
            }
            Outcome::Returned(Err(message)) => self.fail(failed(AppErrorKind::OrchestrationFailed, message)),
            Outcome::Panicked(message) => self.fail(failed(AppErrorKind::Panicked, message)),
            Outcome::Failed(details) => self.fail(details),
            Outcome::ContinueAsNew(input) => {
                let mut carry_forward = ctx.unclaimed_queue_items();
                carry_forward.extend(unprocessed.iter().filter_map(|e| match &e.kind {
                    EventKind::EventEnqueued { queue, data } => Some((queue.clone(), data.clone())),
                    _ => None,
                }));
                self.push_event(None, EventKind::OrchestrationContinuedAsNew { input: input.clone() });
                TurnResult::ContinueAsNew { input, carry_forward }
            }
            Outcome::Nondeterministic(_) => TurnResult::Continue,
        }
    }

    fn fail(&mut self, details: ErrorDetails) -> TurnResult {
        self.push_event(None, EventKind::OrchestrationFailed { details: details.clone() });
        TurnResult::Failed(details)
    }
}
