//! Runtime: orchestration and worker dispatchers over a shared [`Provider`].
//!
//! A runtime owns `orchestration_concurrency` orchestration workers, which run
//! replay turns under an instance lock, and `worker_concurrency` activity
//! workers, which execute activities and hold session leases through the
//! [`SessionManager`](session_manager::SessionManager). Several runtimes may share
//! one provider; the provider's locks keep them apart.

use crate::providers::{ExecutionMetadata, Provider};
use crate::{ActivityContext, ErrorDetails, Event, EventKind, OrchestrationContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod dispatchers;
pub(crate) mod mailbox;
pub mod registry;
pub mod replay_engine;
mod session_manager;
mod state_helpers;

pub use registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
pub use state_helpers::{HistoryManager, WorkItemReader};

use session_manager::SessionManager;

/// Configuration options for the Runtime.
///
/// Override individual fields with struct-update syntax:
///
/// ```rust
/// use duralane::RuntimeOptions;
/// use std::time::Duration;
///
/// let options = RuntimeOptions {
///     worker_concurrency: 8,
///     session_idle_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(options.orchestration_concurrency, 2);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Minimum time between polls when a queue is empty.
    pub dispatcher_min_poll_interval: Duration,
    pub orchestration_concurrency: usize,
    pub worker_concurrency: usize,
    pub orchestrator_lock_timeout: Duration,
    /// Renew this long before expiry (only for timeouts of 15s and more).
    pub orchestrator_lock_renewal_buffer: Duration,
    /// Lease held on an executing activity; renewed in the background.
    pub worker_lock_timeout: Duration,
    pub worker_lock_renewal_buffer: Duration,
    /// Upper bound on how long a running activity takes to notice it was cancelled.
    /// The lease is checked (and renewed) at least this often.
    pub activity_cancellation_check_interval: Duration,
    /// Sessions this runtime may own at once.
    pub max_sessions_per_runtime: usize,
    pub session_lock_timeout: Duration,
    /// An owned session with nothing in flight for this long is released.
    pub session_idle_timeout: Duration,
    /// Label used in worker ids and the session owner id. Random when unset.
    pub worker_identity: Option<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_min_poll_interval: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            orchestrator_lock_timeout: Duration::from_secs(5),
            orchestrator_lock_renewal_buffer: Duration::from_secs(2),
            worker_lock_timeout: Duration::from_secs(30),
            worker_lock_renewal_buffer: Duration::from_secs(5),
            activity_cancellation_check_interval: Duration::from_secs(1),
            max_sessions_per_runtime: 16,
            session_lock_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(60),
            worker_identity: None,
        }
    }
}

/// Observable state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running {
        custom_status: Option<String>,
        custom_status_version: u64,
    },
    Completed {
        output: String,
        custom_status: Option<String>,
        custom_status_version: u64,
    },
    Failed {
        details: ErrorDetails,
        custom_status: Option<String>,
        custom_status_version: u64,
    },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. })
    }

    pub fn custom_status_version(&self) -> u64 {
        match self {
            OrchestrationStatus::NotFound => 0,
            OrchestrationStatus::Running {
                custom_status_version, ..
            }
            | OrchestrationStatus::Completed {
                custom_status_version, ..
            }
            | OrchestrationStatus::Failed {
                custom_status_version, ..
            } => *custom_status_version,
        }
    }

    pub fn custom_status(&self) -> Option<&str> {
        match self {
            OrchestrationStatus::NotFound => None,
            OrchestrationStatus::Running { custom_status, .. }
            | OrchestrationStatus::Completed { custom_status, .. }
            | OrchestrationStatus::Failed { custom_status, .. } => custom_status.as_deref(),
        }
    }
}

/// Error returned by the client wait helpers. `Timeout` says nothing about the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Provider(crate::providers::ProviderError),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for orchestration"),
            WaitError::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<crate::providers::ProviderError> for WaitError {
    fn from(e: crate::providers::ProviderError) -> Self {
        WaitError::Provider(e)
    }
}

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Time cancelled activities get to abandon their items before a forced shutdown
/// aborts the dispatchers.
const SHUTDOWN_CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Await every handle that has not completed yet.
async fn join_unfinished(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut().filter(|h| !h.is_finished()) {
        let _ = handle.await;
    }
}

/// Lock renewal cadence.
///
/// - timeout ≥ 15s: renew at `timeout - buffer`
/// - otherwise: renew at half the timeout (buffer ignored), never below 50ms
pub(crate) fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        lock_timeout
            .saturating_sub(buffer.min(lock_timeout))
            .max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(50))
    }
}

fn generate_runtime_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:06x}", (nanos ^ std::process::id().rotate_left(16)) & 0xff_ffff)
}

pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    options: RuntimeOptions,
    runtime_id: String,
    session_manager: Arc<SessionManager>,
    /// Stops the dispatch loops.
    shutdown: CancellationToken,
    /// Parent of every activity cancellation token; fired when the shutdown deadline passes.
    activity_cancellation: CancellationToken,
}

impl Runtime {
    /// Instance-level metadata for the provider, derived from the turn's delta.
    pub(crate) fn compute_execution_metadata(
        history_delta: &[Event],
        orchestration_name: &str,
        orchestration_version: &str,
    ) -> ExecutionMetadata {
        let mut metadata = ExecutionMetadata {
            orchestration_name: Some(orchestration_name.to_string()),
            orchestration_version: Some(orchestration_version.to_string()),
            ..Default::default()
        };
        for event in history_delta {
            match &event.kind {
                EventKind::OrchestrationCompleted { output } => {
                    metadata.status = Some("Completed".to_string());
                    metadata.output = Some(output.clone());
                }
                EventKind::OrchestrationFailed { details } => {
                    metadata.status = Some("Failed".to_string());
                    metadata.output = Some(serde_json::to_string(details).unwrap_or_else(|_| details.display_message()));
                }
                EventKind::OrchestrationContinuedAsNew { input } => {
                    metadata.status = Some("ContinuedAsNew".to_string());
                    metadata.output = Some(input.clone());
                }
                _ => {}
            }
        }
        metadata
    }

    /// Start with the default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime_id = options.worker_identity.clone().unwrap_or_else(generate_runtime_id);
        let session_manager = Arc::new(SessionManager::new(format!("sessions-{runtime_id}"), &options));

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            runtime_id,
            session_manager,
            shutdown: CancellationToken::new(),
            activity_cancellation: CancellationToken::new(),
        });

        debug!(
            target: "duralane::runtime",
            runtime_id = %runtime.runtime_id,
            provider = runtime.history_store.name(),
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            "Runtime starting"
        );

        let orchestrations = runtime.clone().start_orchestration_dispatcher();
        let workers = runtime.clone().start_work_dispatcher();
        let sweeper = Arc::clone(&runtime.session_manager).spawn_sweeper(
            Arc::clone(&runtime.history_store),
            runtime.shutdown.clone(),
        );
        runtime.joins.lock().await.extend([orchestrations, workers, sweeper]);
        runtime
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Stop fetching and wait for in-flight turns and activities.
    ///
    /// `timeout` (default 1s) bounds the wait. Once it passes, running activities see
    /// cancellation and get a short grace period to hand their items back; then the
    /// dispatchers are aborted together with their worker loops. Leases still held
    /// expire and the work is picked up again by another runtime.
    pub async fn shutdown(self: Arc<Self>, timeout: Option<Duration>) {
        let deadline = timeout.unwrap_or(Duration::from_secs(1));
        self.shutdown.cancel();

        let mut joins: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        if tokio::time::timeout(deadline, join_unfinished(&mut joins)).await.is_err() {
            warn!(
                target: "duralane::runtime",
                runtime_id = %self.runtime_id,
                timeout_ms = deadline.as_millis() as u64,
                "Shutdown deadline passed; cancelling in-flight work"
            );
            self.activity_cancellation.cancel();
            if tokio::time::timeout(SHUTDOWN_CANCEL_GRACE, join_unfinished(&mut joins))
                .await
                .is_err()
            {
                for handle in joins.iter().filter(|h| !h.is_finished()) {
                    handle.abort();
                }
                warn!(target: "duralane::runtime", runtime_id = %self.runtime_id, "Aborted dispatchers that ignored cancellation");
            }
        }
        debug!(target: "duralane::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }

    /// Sleep for `duration` unless shutdown starts first. Returns false on shutdown.
    pub(crate) async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
