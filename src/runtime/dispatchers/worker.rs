//! Worker dispatcher.
//!
//! Fetches activity work under a peek-lock, runs the registered handler, and acks
//! the completion back to the orchestrator queue. Session-bound activities are only
//! fetched when this runtime owns (or may claim) their session.

use crate::providers::{Provider, WorkItem};
use crate::runtime::replay_engine::panic_message;
use crate::runtime::{Runtime, calculate_renewal_interval};
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn a background task to renew the lock for an in-flight activity.
///
/// A failed renewal means the item is gone (cancelled by its orchestration) or the
/// lock was lost, so the activity's token is cancelled and the task exits. Renewal
/// runs at least every `check_interval` so a cancelled race loser is noticed quickly
/// even under a long lock.
fn spawn_activity_lock_renewal_task(
    store: Arc<dyn Provider>,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    check_interval: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer)
        .min(check_interval)
        .max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = interval.tick() => {
                    match store.renew_work_item_lock(&token, lock_timeout).await {
                        Ok(()) => tracing::trace!(
                            target: "duralane::runtime::dispatchers::worker",
                            lock_token = %token,
                            "Activity lock renewed"
                        ),
                        Err(e) => {
                            debug!(
                                target: "duralane::runtime::dispatchers::worker",
                                lock_token = %token,
                                error = %e,
                                "Activity lock renewal failed, cancelling activity"
                            );
                            cancellation.cancel();
                            break;
                        }
                    }
                }
            }
        }
    })
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers.
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        tokio::spawn(async move {
            // Owned by this task: aborting the dispatcher aborts every worker loop.
            let mut workers = JoinSet::new();
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(async move { rt.activity_worker_loop(worker_id).await });
            }
            while workers.join_next().await.is_some() {}
        })
    }

    async fn activity_worker_loop(self: Arc<Self>, worker_id: String) {
        while !self.shutdown.is_cancelled() {
            let started = Instant::now();
            let reservation = self.session_manager.try_reserve();
            let config = self.session_manager.fetch_config(&reservation);
            match self
                .history_store
                .fetch_work_item(self.options.worker_lock_timeout, Some(&config))
                .await
            {
                Ok(Some((item, lock_token))) => {
                    let session_id = item.session_id().map(str::to_string);
                    self.session_manager.on_fetched(session_id.as_deref(), reservation);
                    self.execute_activity(item, &lock_token, &worker_id).await;
                    self.session_manager.on_finished(session_id.as_deref());
                    continue;
                }
                Ok(None) => self.session_manager.release_reservation(reservation),
                Err(e) => {
                    self.session_manager.release_reservation(reservation);
                    warn!(target: "duralane::runtime", worker_id = %worker_id, error = %e, "Error fetching work item");
                    if !self.idle(Duration::from_millis(100)).await {
                        break;
                    }
                    continue;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.options.dispatcher_min_poll_interval {
                if !self.idle(self.options.dispatcher_min_poll_interval - elapsed).await {
                    break;
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn execute_activity(&self, item: WorkItem, lock_token: &str, worker_id: &str) {
        let (instance, execution_id, id, name, input, session_id) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
                session_id,
            } => (instance, execution_id, id, name, input, session_id),
            other => {
                warn!(target: "duralane::runtime", worker_id = %worker_id, kind = other.kind(), "Unexpected item on worker queue, dropping");
                let _ = self.history_store.ack_work_item(lock_token, None).await;
                return;
            }
        };

        let cancellation = self.activity_cancellation.child_token();
        let renewal = spawn_activity_lock_renewal_task(
            Arc::clone(&self.history_store),
            lock_token.to_string(),
            self.options.worker_lock_timeout,
            self.options.worker_lock_renewal_buffer,
            self.options.activity_cancellation_check_interval,
            cancellation.clone(),
        );

        let orchestration_name = match self.history_store.get_instance_info(&instance).await {
            Ok(Some(info)) => info.orchestration_name,
            _ => "unknown".to_string(),
        };
        debug!(
            target: "duralane::runtime",
            instance_id = %instance,
            execution_id,
            orchestration_name = %orchestration_name,
            activity_name = %name,
            activity_id = id,
            session_id = ?session_id,
            worker_id = %worker_id,
            "Activity started"
        );

        let outcome = match self.activity_registry.resolve_handler(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext::new(
                    instance.clone(),
                    execution_id,
                    orchestration_name,
                    name.clone(),
                    id,
                    session_id,
                    worker_id.to_string(),
                    cancellation.clone(),
                );
                match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(message)) => Err(ErrorDetails::Application {
                        kind: AppErrorKind::ActivityFailed,
                        message,
                        retryable: false,
                    }),
                    Err(panic) => Err(ErrorDetails::Application {
                        kind: AppErrorKind::Panicked,
                        message: panic_message(panic),
                        retryable: false,
                    }),
                }
            }
            None => Err(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: name.clone(),
                message: None,
            }),
        };

        if cancellation.is_cancelled() {
            renewal.abort();
            debug!(
                target: "duralane::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                "Activity cancelled, result discarded"
            );
            // The row is already gone when the orchestration cancelled it; on shutdown it
            // becomes visible again for another worker.
            let _ = self.history_store.abandon_work_item(lock_token, None).await;
            return;
        }
        cancellation.cancel();
        renewal.abort();

        let completion = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                execution_id,
                id,
                result,
            },
            Err(details) => {
                warn!(
                    target: "duralane::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    error_type = details.category(),
                    error = %details.display_message(),
                    "Activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    details,
                }
            }
        };

        if let Err(e) = self.history_store.ack_work_item(lock_token, Some(completion)).await {
            warn!(
                target: "duralane::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                error = %e,
                "Failed to ack activity completion"
            );
        }
    }
}
