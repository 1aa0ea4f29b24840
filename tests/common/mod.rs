#![allow(dead_code)]

pub mod fault_injection;
pub mod tracing_capture;

use duralane::providers::Provider;
use duralane::providers::in_memory::InMemoryProvider;
use duralane::providers::sqlite::SqliteProvider;
use duralane::{Event, EventKind, RuntimeOptions};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Options tuned for tests: fast polling, short session idle time.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_min_poll_interval: Duration::from_millis(5),
        session_idle_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn in_memory_store() -> StdArc<dyn Provider> {
    StdArc::new(InMemoryProvider::new())
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = open_sqlite_store(&td).await;
    (store, td)
}

/// Open (or reopen) the database file inside `td`.
pub async fn open_sqlite_store(td: &TempDir) -> StdArc<dyn Provider> {
    let db_url = format!("sqlite:{}?mode=rwc", td.path().join("test.db").display());
    StdArc::new(SqliteProvider::new(&db_url, None).await.unwrap()) as StdArc<dyn Provider>
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_subscription(store: StdArc<dyn Provider>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter().any(|e| match &e.kind {
                EventKind::ExternalSubscribed { name: n } => n == name,
                EventKind::QueueSubscribed { queue } => queue == name,
                _ => false,
            })
        },
        timeout_ms,
    )
    .await
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn Provider>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&[Event]) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if let Some(e) = selector(&hist) {
            return Some(e);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Names of the event kinds in `history`, for compact assertions.
pub fn kinds(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(|e| e.kind.name()).collect()
}
