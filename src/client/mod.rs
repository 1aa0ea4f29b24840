use std::sync::Arc;
use std::time::Duration;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::{AppErrorKind, ErrorDetails, Event};
use serde::Serialize;

/// Error returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The provider rejected or failed the operation.
    Provider(ProviderError),
    /// A typed payload could not be serialized.
    Encode(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::Encode(msg) => write!(f, "encode: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Thin client for control-plane operations.
///
/// The client never talks to a runtime directly: every call either enqueues a
/// message for the orchestrator queue or reads state through the shared
/// [`Provider`]. Any number of clients and runtimes may share one store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider instance.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    async fn enqueue(&self, item: WorkItem) -> Result<(), ClientError> {
        self.store.enqueue_for_orchestrator(item, None).await?;
        Ok(())
    }

    /// Start an orchestration instance with string input, resolving the version by policy.
    ///
    /// Starting an id that already has history is a no-op; the runtime logs and drops it.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue(WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            version: None,
            input: input.into(),
        })
        .await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue(WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            version: Some(version.into()),
            input: input.into(),
        })
        .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(ClientError::Encode)?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Raise a named signal. Recorded even if nothing is waiting for it yet.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue(WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.into(),
            data: data.into(),
        })
        .await
    }

    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: &T,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(data).map_err(ClientError::Encode)?;
        self.raise_event(instance, event_name, payload).await
    }

    /// Append to a durable FIFO queue of the instance.
    pub async fn enqueue_event(
        &self,
        instance: &str,
        queue: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue(WorkItem::QueueMessage {
            instance: instance.to_string(),
            queue: queue.into(),
            data: data.into(),
        })
        .await
    }

    pub async fn enqueue_event_typed<T: Serialize>(
        &self,
        instance: &str,
        queue: impl Into<String>,
        data: &T,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(data).map_err(ClientError::Encode)?;
        self.enqueue_event(instance, queue, payload).await
    }

    /// Current status of the instance, including its custom status.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let Some(info) = self.store.get_instance_info(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        let custom_status = info.custom_status;
        let custom_status_version = info.custom_status_version;
        Ok(match info.status.as_str() {
            "Completed" => OrchestrationStatus::Completed {
                output: info.output.unwrap_or_default(),
                custom_status,
                custom_status_version,
            },
            "Failed" => OrchestrationStatus::Failed {
                details: parse_failure(info.output.as_deref()),
                custom_status,
                custom_status_version,
            },
            _ => OrchestrationStatus::Running {
                custom_status,
                custom_status_version,
            },
        })
    }

    /// `Some((value, version))` if the custom status version is above `since_version`.
    pub async fn get_custom_status(
        &self,
        instance: &str,
        since_version: u64,
    ) -> Result<Option<(Option<String>, u64)>, ClientError> {
        Ok(self.store.get_custom_status(instance, since_version).await?)
    }

    /// History of the latest execution.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read(instance).await?)
    }

    /// History of one specific execution.
    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_with_execution(instance, execution_id).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Poll until the instance is Completed or Failed.
    ///
    /// Polling starts at 5ms and backs off to 100ms.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.status_for_wait(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Long-poll for a custom status change.
    ///
    /// Returns the latest status once its custom status version exceeds `since_version`,
    /// else `WaitError::Timeout` when the deadline passes. A terminal instance whose
    /// version never moves past `since_version` also times out; use
    /// `wait_for_orchestration` to wait for completion.
    pub async fn wait_for_status_change(
        &self,
        instance: &str,
        since_version: u64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status_for_wait(instance).await?;
            if status.custom_status_version() > since_version {
                return Ok(status);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn status_for_wait(&self, instance: &str) -> Result<OrchestrationStatus, WaitError> {
        match self.get_orchestration_status(instance).await {
            Ok(status) => Ok(status),
            Err(ClientError::Provider(e)) => Err(WaitError::Provider(e)),
            Err(ClientError::Encode(msg)) => Err(WaitError::Provider(ProviderError::permanent("status", msg))),
        }
    }
}

/// Failed executions store serialized `ErrorDetails` as output; anything else is
/// surfaced as an application failure carrying the raw text.
fn parse_failure(output: Option<&str>) -> ErrorDetails {
    let raw = output.unwrap_or_default();
    serde_json::from_str(raw).unwrap_or_else(|_| ErrorDetails::Application {
        kind: AppErrorKind::OrchestrationFailed,
        message: raw.to_string(),
        retryable: false,
    })
}
