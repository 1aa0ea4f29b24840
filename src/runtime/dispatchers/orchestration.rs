//! Orchestration dispatcher.
//!
//! Each worker fetches one instance batch under the instance lock, replays the
//! current execution through a [`ReplayEngine`], and commits the resulting delta
//! with a single `ack_orchestration_item`.

use crate::providers::{OrchestrationItem, Provider, ProviderError, ScheduledActivityIdentifier, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::{HistoryManager, OrchestrationHandler, Runtime, WorkItemReader, calculate_renewal_interval};
use crate::{ConfigErrorKind, ErrorDetails, Event, EventKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const ACK_MAX_ATTEMPTS: u32 = 5;
/// Visibility delay for a batch handed back after a retryable ack failure.
const ABANDON_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Everything one turn commits.
struct TurnOutput {
    execution_id: u64,
    orchestration_name: String,
    orchestration_version: String,
    history_delta: Vec<Event>,
    worker_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    cancelled_activities: Vec<ScheduledActivityIdentifier>,
}

/// Spawn a background task to renew the lock for an in-flight orchestration.
fn spawn_orchestration_lock_renewal_task(
    store: Arc<dyn Provider>,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = store.renew_orchestration_item_lock(&token, lock_timeout).await {
                        tracing::debug!(
                            target: "duralane::runtime::dispatchers::orchestration",
                            lock_token = %token,
                            error = %e,
                            "Failed to renew orchestration lock (may have been acked/abandoned)"
                        );
                        break;
                    }
                }
            }
        }
    })
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        tokio::spawn(async move {
            // Owned by this task: aborting the dispatcher aborts every worker loop.
            let mut workers = JoinSet::new();
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(async move { rt.orchestration_worker_loop(worker_id).await });
            }
            while workers.join_next().await.is_some() {}
        })
    }

    async fn orchestration_worker_loop(self: Arc<Self>, worker_id: String) {
        while !self.shutdown.is_cancelled() {
            let started = Instant::now();
            match self
                .history_store
                .fetch_orchestration_item(self.options.orchestrator_lock_timeout)
                .await
            {
                Ok(Some((item, lock_token))) => {
                    let renewal = spawn_orchestration_lock_renewal_task(
                        Arc::clone(&self.history_store),
                        lock_token.clone(),
                        self.options.orchestrator_lock_timeout,
                        self.options.orchestrator_lock_renewal_buffer,
                        self.shutdown.clone(),
                    );
                    self.process_orchestration_item(item, &lock_token, &worker_id).await;
                    renewal.abort();
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "duralane::runtime", worker_id = %worker_id, error = %e, "Error fetching orchestration item");
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

    /// Run one turn for a locked batch and commit it.
    pub(in crate::runtime) async fn process_orchestration_item(
        self: &Arc<Self>,
        item: OrchestrationItem,
        lock_token: &str,
        worker_id: &str,
    ) {
        let instance = item.instance.as_str();
        let history_mgr = HistoryManager::from_history(&item.history);
        let reader = WorkItemReader::from_messages(&item.messages, &history_mgr, instance);

        let starts_next_execution = reader.is_continue_as_new && history_mgr.is_continued_as_new;
        if history_mgr.is_terminal() && !starts_next_execution {
            warn!(
                target: "duralane::runtime",
                instance_id = %instance,
                execution_id = item.execution_id,
                status = history_mgr.status(),
                dropped = item.messages.len(),
                "Instance is terminal, dropping batch"
            );
            self.ack_empty(lock_token, item.execution_id).await;
            return;
        }
        if !reader.has_orchestration_name() {
            warn!(
                target: "duralane::runtime",
                instance_id = %instance,
                dropped = item.messages.len(),
                "Messages for an instance that was never started, dropping batch"
            );
            self.ack_empty(lock_token, item.execution_id).await;
            return;
        }
        if reader.has_start_item() && !history_mgr.is_empty() && !starts_next_execution {
            warn!(target: "duralane::runtime", instance_id = %instance, "Instance already started, ignoring duplicate start");
        }

        let turn = self.run_turn(&item, &history_mgr, &reader, starts_next_execution, worker_id);
        let metadata = Runtime::compute_execution_metadata(
            &turn.history_delta,
            &turn.orchestration_name,
            &turn.orchestration_version,
        );
        if let Some(status) = metadata.status.as_deref() {
            let outcome = metadata.output.as_deref().unwrap_or_default();
            match status {
                "Failed" => warn!(
                    target: "duralane::runtime",
                    instance_id = %instance,
                    execution_id = turn.execution_id,
                    orchestration_name = %turn.orchestration_name,
                    worker_id = %worker_id,
                    error = %outcome,
                    "Orchestration failed"
                ),
                _ => tracing::debug!(
                    target: "duralane::runtime",
                    instance_id = %instance,
                    execution_id = turn.execution_id,
                    orchestration_name = %turn.orchestration_name,
                    orchestration_version = %turn.orchestration_version,
                    worker_id = %worker_id,
                    status,
                    "Orchestration execution finished"
                ),
            }
        }

        let ack = self
            .ack_orchestration_with_changes(
                lock_token,
                turn.execution_id,
                turn.history_delta,
                turn.worker_items,
                turn.orchestrator_items,
                metadata,
                turn.cancelled_activities,
            )
            .await;

        match ack {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                // Transient storage failure: redeliver the batch instead of failing the instance.
                warn!(
                    target: "duralane::runtime",
                    instance_id = %instance,
                    error = %e,
                    delay_ms = ABANDON_RETRY_DELAY.as_millis() as u64,
                    "Ack retries exhausted, abandoning orchestration item for redelivery"
                );
                if let Err(e2) = self
                    .history_store
                    .abandon_orchestration_item(lock_token, Some(ABANDON_RETRY_DELAY))
                    .await
                {
                    warn!(target: "duralane::runtime", instance_id = %instance, error = %e2, "Failed to abandon orchestration item; lock will expire");
                }
            }
            Err(e) => {
                warn!(target: "duralane::runtime", instance_id = %instance, error = %e, "Failed to ack orchestration item, failing orchestration");
                self.commit_infrastructure_failure(&item, &reader, lock_token, e).await;
            }
        }
    }

    /// Build the turn: resolve the handler, seed the engine, replay.
    fn run_turn(
        &self,
        item: &OrchestrationItem,
        history_mgr: &HistoryManager,
        reader: &WorkItemReader,
        starts_next_execution: bool,
        worker_id: &str,
    ) -> TurnOutput {
        let instance = item.instance.as_str();
        let (execution_id, baseline) = if starts_next_execution {
            (item.execution_id + 1, Vec::new())
        } else {
            (item.execution_id, item.history.clone())
        };
        let is_new_execution = baseline.is_empty();
        // A duplicate start never overrides what the running execution pinned.
        let (name, requested_version) = if is_new_execution {
            (reader.orchestration_name.clone(), reader.version.clone())
        } else {
            (
                history_mgr.orchestration_name.clone().unwrap_or_default(),
                history_mgr.version(),
            )
        };
        let mut engine = ReplayEngine::new(instance, execution_id, baseline);

        let resolved = self.resolve_orchestration(&name, requested_version.as_deref(), is_new_execution);
        let (version, handler) = match resolved {
            Ok(found) => found,
            Err(version) => {
                if is_new_execution {
                    engine.push_event(
                        None,
                        EventKind::OrchestrationStarted {
                            name: name.clone(),
                            version: version.clone(),
                            input: reader.input.clone(),
                        },
                    );
                }
                engine.push_event(
                    None,
                    EventKind::OrchestrationFailed {
                        details: ErrorDetails::Configuration {
                            kind: ConfigErrorKind::UnregisteredOrchestration,
                            resource: name.clone(),
                            message: Some(format!("no handler registered for {name}@{version}")),
                        },
                    },
                );
                let (history_delta, _, _, _) = engine.into_parts();
                return TurnOutput {
                    execution_id,
                    orchestration_name: name,
                    orchestration_version: version,
                    history_delta,
                    worker_items: Vec::new(),
                    orchestrator_items: Vec::new(),
                    cancelled_activities: Vec::new(),
                };
            }
        };

        if is_new_execution {
            tracing::debug!(
                target: "duralane::runtime",
                instance_id = %instance,
                execution_id,
                orchestration_name = %name,
                orchestration_version = %version,
                worker_id = %worker_id,
                is_continue_as_new = reader.is_continue_as_new,
                "Orchestration started"
            );
            engine.push_event(
                None,
                EventKind::OrchestrationStarted {
                    name: name.clone(),
                    version: version.clone(),
                    input: reader.input.clone(),
                },
            );
            for (queue, data) in &reader.carry_forward {
                engine.push_event(
                    None,
                    EventKind::EventEnqueued {
                        queue: queue.clone(),
                        data: data.clone(),
                    },
                );
            }
        }

        engine.prep_completions(&reader.completion_messages);
        let result = engine.execute_orchestration(handler);

        let (history_delta, worker_items, mut orchestrator_items, cancelled) = engine.into_parts();
        if let TurnResult::ContinueAsNew { input, carry_forward } = result {
            orchestrator_items.push(WorkItem::ContinueAsNew {
                instance: instance.to_string(),
                orchestration: name.clone(),
                version: version.clone(),
                input,
                carry_forward,
            });
        }
        let cancelled_activities = cancelled
            .into_iter()
            .map(|activity_id| ScheduledActivityIdentifier {
                instance: instance.to_string(),
                execution_id,
                activity_id,
            })
            .collect();

        TurnOutput {
            execution_id,
            orchestration_name: name,
            orchestration_version: version,
            history_delta,
            worker_items,
            orchestrator_items,
            cancelled_activities,
        }
    }

    /// New executions pick a version by policy unless one was requested; replays use
    /// the pinned version exactly. `Err` carries the version to record.
    fn resolve_orchestration(
        &self,
        name: &str,
        version: Option<&str>,
        is_new_execution: bool,
    ) -> Result<(String, Arc<dyn OrchestrationHandler>), String> {
        match version {
            Some(v) => {
                let parsed = semver::Version::parse(v).map_err(|_| v.to_string())?;
                self.orchestration_registry
                    .resolve_handler_exact(name, &parsed)
                    .map(|h| (v.to_string(), h))
                    .ok_or_else(|| v.to_string())
            }
            None if is_new_execution => self
                .orchestration_registry
                .resolve_handler(name)
                .map(|(v, h)| (v.to_string(), h))
                .ok_or_else(|| "0.0.0".to_string()),
            None => Err("0.0.0".to_string()),
        }
    }

    async fn ack_empty(&self, lock_token: &str, execution_id: u64) {
        if let Err(e) = self
            .ack_orchestration_with_changes(
                lock_token,
                execution_id,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Default::default(),
                Vec::new(),
            )
            .await
        {
            warn!(target: "duralane::runtime", error = %e, "Failed to ack dropped batch");
        }
    }

    /// Record a permanent ack failure in history so the instance does not spin; abandon if
    /// even that fails.
    async fn commit_infrastructure_failure(
        &self,
        item: &OrchestrationItem,
        reader: &WorkItemReader,
        lock_token: &str,
        error: ProviderError,
    ) {
        let mut engine = ReplayEngine::new(item.instance.as_str(), item.execution_id, item.history.clone());
        let version = item.history.first().and_then(|e| match &e.kind {
            EventKind::OrchestrationStarted { version, .. } => Some(version.clone()),
            _ => None,
        });
        if version.is_none() {
            engine.push_event(
                None,
                EventKind::OrchestrationStarted {
                    name: reader.orchestration_name.clone(),
                    version: reader.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
                    input: reader.input.clone(),
                },
            );
        }
        engine.push_event(
            None,
            EventKind::OrchestrationFailed {
                details: error.to_infrastructure_error(),
            },
        );
        let (delta, _, _, _) = engine.into_parts();
        let metadata = Runtime::compute_execution_metadata(
            &delta,
            &reader.orchestration_name,
            version.as_deref().unwrap_or("0.0.0"),
        );

        match self
            .ack_orchestration_with_changes(lock_token, item.execution_id, delta, Vec::new(), Vec::new(), metadata, Vec::new())
            .await
        {
            Ok(()) => warn!(target: "duralane::runtime", instance_id = %item.instance, "Committed orchestration failure event"),
            Err(e2) => {
                warn!(target: "duralane::runtime", instance_id = %item.instance, error = %e2, "Failed to commit failure event, abandoning lock");
                let _ = self
                    .history_store
                    .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                    .await;
            }
        }
    }

    /// Ack with retry on retryable provider errors (5 attempts, 10ms·2^n backoff).
    #[allow(clippy::too_many_arguments)]
    pub(in crate::runtime) async fn ack_orchestration_with_changes(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: crate::providers::ExecutionMetadata,
        cancelled_activities: Vec<ScheduledActivityIdentifier>,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        loop {
            let result = self
                .history_store
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    orchestrator_items.clone(),
                    metadata.clone(),
                    cancelled_activities.clone(),
                )
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    warn!(target: "duralane::runtime", error = %e, "ack_orchestration_item failed with non-retryable error");
                    return Err(e);
                }
                Err(e) if attempts + 1 < ACK_MAX_ATTEMPTS => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(target: "duralane::runtime", attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(target: "duralane::runtime", attempts, error = %e, "Failed to ack_orchestration_item after max retries");
                    return Err(e);
                }
            }
        }
    }
}
