//! Task handles and the `all` / `race` combinators.
//!
//! A task is created (and its command emitted) when the scheduling call is made, so
//! command order is source order. Polling a task only reads the state the engine
//! has delivered from history; there is no waker plumbing.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{OrchestrationContext, TaskKind};

/// Raw resolved value of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    Event(String),
}

/// Per-slot outcome produced by the combinators. Timers resolve to `Ok(None)`.
pub type TaskResult = Result<Option<String>, String>;

impl DurableOutput {
    pub fn into_task_result(self) -> TaskResult {
        match self {
            DurableOutput::Activity(r) => r.map(Some),
            DurableOutput::Timer => Ok(None),
            DurableOutput::Event(data) => Ok(Some(data)),
        }
    }
}

/// Type-erased task, the unit accepted by [`OrchestrationContext::all`] and
/// [`OrchestrationContext::race`].
pub struct Task {
    token: u64,
    kind: TaskKind,
    ctx: OrchestrationContext,
}

impl Task {
    pub(crate) fn new(token: u64, kind: TaskKind, ctx: OrchestrationContext) -> Self {
        Self { token, kind, ctx }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    fn poll_output(&self) -> Option<DurableOutput> {
        self.ctx.poll_task(self.token)
    }

    fn cancel(&self) {
        self.ctx.cancel_task(self.token, self.kind);
    }

    /// View an activity task as its typed future again.
    pub fn into_activity(self) -> DurableFuture<Result<String, String>> {
        DurableFuture::new(self)
    }

    pub fn into_timer(self) -> DurableFuture<()> {
        DurableFuture::new(self)
    }

    /// Signal and queue tasks resolve to their payload.
    pub fn into_event(self) -> DurableFuture<String> {
        DurableFuture::new(self)
    }
}

#[doc(hidden)]
pub trait FromDurableOutput {
    fn from_output(output: DurableOutput) -> Self;
}

impl FromDurableOutput for Result<String, String> {
    fn from_output(output: DurableOutput) -> Self {
        match output {
            DurableOutput::Activity(r) => r,
            other => Err(format!("unexpected completion for activity: {other:?}")),
        }
    }
}

impl FromDurableOutput for () {
    fn from_output(_output: DurableOutput) -> Self {}
}

impl FromDurableOutput for String {
    fn from_output(output: DurableOutput) -> Self {
        match output {
            DurableOutput::Event(data) | DurableOutput::Activity(Ok(data)) => data,
            DurableOutput::Activity(Err(e)) => e,
            DurableOutput::Timer => String::new(),
        }
    }
}

/// Awaitable handle for one scheduled operation.
pub struct DurableFuture<T> {
    task: Task,
    _output: PhantomData<fn() -> T>,
}

impl<T> DurableFuture<T> {
    pub(crate) fn new(task: Task) -> Self {
        Self {
            task,
            _output: PhantomData,
        }
    }

    /// Erase the output type so the task can be passed to `all` or `race`.
    pub fn into_task(self) -> Task {
        self.task
    }
}

impl<T> From<DurableFuture<T>> for Task {
    fn from(f: DurableFuture<T>) -> Self {
        f.task
    }
}

impl<T: FromDurableOutput> Future for DurableFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        match self.task.poll_output() {
            Some(output) => Poll::Ready(T::from_output(output)),
            None => Poll::Pending,
        }
    }
}

/// Output of [`OrchestrationContext::all`]: one outcome per input slot, in input order.
pub struct JoinFuture {
    tasks: Vec<Task>,
    outputs: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(tasks: Vec<Task>) -> Self {
        let outputs = tasks.iter().map(|_| None).collect();
        Self { tasks, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<TaskResult>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (task, slot) in this.tasks.iter().zip(this.outputs.iter_mut()) {
            if slot.is_none() {
                *slot = task.poll_output();
            }
        }
        if this.outputs.iter().any(Option::is_none) {
            return Poll::Pending;
        }
        Poll::Ready(
            this.outputs
                .iter_mut()
                .filter_map(Option::take)
                .map(DurableOutput::into_task_result)
                .collect(),
        )
    }
}

/// Winner of a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceResult {
    pub index: usize,
    pub value: TaskResult,
}

/// Output of [`OrchestrationContext::race`].
///
/// Members are checked in input order at each poll. Because the engine polls after
/// every delivered completion, the member whose completion appears first in history
/// is the one found ready, on the first run and on every replay.
pub struct RaceFuture {
    tasks: Vec<Task>,
    finished: bool,
}

impl RaceFuture {
    pub(crate) fn new(tasks: Vec<Task>) -> Self {
        Self { tasks, finished: false }
    }
}

impl Future for RaceFuture {
    type Output = RaceResult;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<RaceResult> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Pending;
        }
        let winner = this
            .tasks
            .iter()
            .enumerate()
            .find_map(|(index, task)| task.poll_output().map(|output| (index, output)));
        let Some((index, output)) = winner else {
            return Poll::Pending;
        };
        this.finished = true;
        for (i, task) in this.tasks.iter().enumerate() {
            if i != index {
                task.cancel();
            }
        }
        Poll::Ready(RaceResult {
            index,
            value: output.into_task_result(),
        })
    }
}

/// Returned by [`OrchestrationContext::continue_as_new`]. Never resolves; the engine
/// ends the execution at the poll where it was requested.
pub struct ContinueAsNewFuture;

impl Future for ContinueAsNewFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mailbox::MailboxKey;

    fn poll_once<F: Future + Unpin>(f: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
        Pin::new(f).poll(&mut cx)
    }

    fn bind_all(ctx: &OrchestrationContext, first_id: u64) {
        let mut id = first_id;
        while let Some(emitted) = ctx.pop_emitted() {
            ctx.bind(&emitted, id);
            id += 1;
        }
    }

    #[test]
    fn join_preserves_input_order_regardless_of_completion_order() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let act = ctx.schedule_activity("Slow", "x").into_task();
        let timer = ctx.schedule_timer(std::time::Duration::from_millis(10)).into_task();
        let mut join = ctx.all(vec![act, timer]);
        bind_all(&ctx, 2);

        assert!(poll_once(&mut join).is_pending());
        ctx.deliver_completion(3, DurableOutput::Timer);
        assert!(poll_once(&mut join).is_pending());
        ctx.deliver_completion(2, DurableOutput::Activity(Ok("done".into())));
        match poll_once(&mut join) {
            Poll::Ready(out) => assert_eq!(out, vec![Ok(Some("done".to_string())), Ok(None)]),
            Poll::Pending => panic!("join should be ready"),
        }
    }

    #[test]
    fn join_keeps_failed_slots() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let a = ctx.schedule_activity("A", "").into_task();
        let b = ctx.schedule_activity("B", "").into_task();
        let mut join = ctx.all(vec![a, b]);
        bind_all(&ctx, 2);
        ctx.deliver_completion(2, DurableOutput::Activity(Err("bad".into())));
        assert!(poll_once(&mut join).is_pending());
        ctx.deliver_completion(3, DurableOutput::Activity(Ok("ok".into())));
        match poll_once(&mut join) {
            Poll::Ready(out) => assert_eq!(out, vec![Err("bad".to_string()), Ok(Some("ok".to_string()))]),
            Poll::Pending => panic!("join should be ready"),
        }
    }

    #[test]
    fn race_cancels_losers_and_reports_pending_activity() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let timer = ctx.schedule_timer(std::time::Duration::from_millis(50)).into_task();
        let glacial = ctx.schedule_activity("Glacial", "").into_task();
        let mut race = ctx.race(vec![timer, glacial]);
        bind_all(&ctx, 2);

        ctx.deliver_completion(2, DurableOutput::Timer);
        match poll_once(&mut race) {
            Poll::Ready(r) => assert_eq!(r, RaceResult { index: 0, value: Ok(None) }),
            Poll::Pending => panic!("race should be ready"),
        }
        assert_eq!(ctx.cancelled_activities(), vec![3]);
    }

    #[test]
    fn race_loser_queue_item_is_returned() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let timer = ctx.schedule_timer(std::time::Duration::from_millis(5)).into_task();
        let dq = ctx.dequeue_event("inbox").into_task();
        let mut race = ctx.race(vec![timer, dq]);
        bind_all(&ctx, 2);
        ctx.deliver_completion(2, DurableOutput::Timer);
        ctx.deliver_arrival(MailboxKey::Queue("inbox".into()), 4, "m1".into());

        match poll_once(&mut race) {
            Poll::Ready(r) => assert_eq!(r.index, 0),
            Poll::Pending => panic!("race should be ready"),
        }
        assert_eq!(ctx.unclaimed_queue_items(), vec![("inbox".to_string(), "m1".to_string())]);
    }

    #[test]
    fn continue_as_new_future_never_resolves() {
        let ctx = OrchestrationContext::new("i", 1, "o", "1.0.0");
        let mut f = ctx.continue_as_new("next");
        assert!(poll_once(&mut f).is_pending());
        assert_eq!(ctx.take_continue_as_new().as_deref(), Some("next"));
    }
}
