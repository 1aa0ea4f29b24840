//! In-process provider. All state sits behind one async mutex, which makes every
//! trait call trivially atomic. Intended for tests and single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, ProviderError, ScheduledActivityIdentifier,
    SessionFetchConfig, WorkItem, custom_status_updates,
};
use crate::{Event, INITIAL_EXECUTION_ID, now_ms};

#[derive(Debug)]
struct InstanceRow {
    orchestration_name: String,
    orchestration_version: String,
    current_execution_id: u64,
    status: String,
    output: Option<String>,
    custom_status: Option<String>,
    custom_status_version: u64,
    executions: BTreeMap<u64, Vec<Event>>,
}

#[derive(Debug)]
struct OrchestratorRow {
    id: u64,
    item: WorkItem,
    visible_at: u64,
}

#[derive(Debug)]
struct InstanceLock {
    token: String,
    locked_until: u64,
    message_ids: Vec<u64>,
}

#[derive(Debug)]
struct WorkerRow {
    id: u64,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
    locked_until: u64,
}

impl WorkerRow {
    fn is_locked(&self, now: u64) -> bool {
        self.lock_token.is_some() && self.locked_until > now
    }

    fn identity(&self) -> Option<ScheduledActivityIdentifier> {
        match &self.item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                ..
            } => Some(ScheduledActivityIdentifier {
                instance: instance.clone(),
                execution_id: *execution_id,
                activity_id: *id,
            }),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SessionRow {
    owner_id: String,
    locked_until: u64,
    last_activity_at: u64,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    instances: HashMap<String, InstanceRow>,
    orchestrator_queue: Vec<OrchestratorRow>,
    instance_locks: HashMap<String, InstanceLock>,
    worker_queue: Vec<WorkerRow>,
    sessions: HashMap<String, SessionRow>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn token(&mut self, prefix: &str) -> String {
        let id = self.next_id();
        format!("{prefix}-{id}-{}", now_ms())
    }

    fn push_orchestrator(&mut self, item: WorkItem, visible_at: u64) {
        let id = self.next_id();
        self.orchestrator_queue.push(OrchestratorRow { id, item, visible_at });
    }

    fn push_worker(&mut self, item: WorkItem, now: u64) {
        let id = self.next_id();
        self.worker_queue.push(WorkerRow {
            id,
            item,
            visible_at: now,
            lock_token: None,
            locked_until: 0,
        });
    }

    fn session_has_items(&self, session_id: &str) -> bool {
        self.worker_queue.iter().any(|r| r.item.session_id() == Some(session_id))
    }

    /// Index of the next fetchable worker row.
    fn next_work_row(&self, now: u64, session: Option<&SessionFetchConfig>) -> Option<usize> {
        self.worker_queue.iter().enumerate().find_map(|(idx, row)| {
            if row.visible_at > now || row.is_locked(now) {
                return None;
            }
            let Some(sid) = row.item.session_id() else {
                return Some(idx);
            };
            let cfg = session?;
            let mut siblings = self.worker_queue.iter().filter(|r| r.item.session_id() == Some(sid));
            let head_id = siblings.clone().map(|r| r.id).min();
            if head_id != Some(row.id) || siblings.any(|r| r.is_locked(now)) {
                return None;
            }
            match self.sessions.get(sid) {
                Some(s) if s.owner_id == cfg.owner_id => Some(idx),
                Some(s) if s.locked_until > now => None,
                _ if cfg.can_claim_new => Some(idx),
                _ => None,
            }
        })
    }
}

/// In-memory `Provider`.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();

        let candidate = st
            .orchestrator_queue
            .iter()
            .filter(|m| m.visible_at <= now)
            .map(|m| m.item.instance().to_string())
            .find(|inst| st.instance_locks.get(inst).is_none_or(|l| l.locked_until <= now));
        let Some(instance) = candidate else {
            return Ok(None);
        };

        let (message_ids, messages): (Vec<u64>, Vec<WorkItem>) = st
            .orchestrator_queue
            .iter()
            .filter(|m| m.visible_at <= now && m.item.instance() == instance)
            .map(|m| (m.id, m.item.clone()))
            .unzip();

        let token = st.token("orch");
        st.instance_locks.insert(
            instance.clone(),
            InstanceLock {
                token: token.clone(),
                locked_until: now + lock_timeout.as_millis() as u64,
                message_ids,
            },
        );

        let item = match st.instances.get(&instance) {
            Some(row) => OrchestrationItem {
                instance: instance.clone(),
                orchestration_name: row.orchestration_name.clone(),
                version: row.orchestration_version.clone(),
                execution_id: row.current_execution_id,
                history: row
                    .executions
                    .get(&row.current_execution_id)
                    .cloned()
                    .unwrap_or_default(),
                messages,
            },
            None => {
                let (name, version) = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration {
                            orchestration, version, ..
                        } => Some((orchestration.clone(), version.clone().unwrap_or_default())),
                        _ => None,
                    })
                    .unwrap_or_default();
                OrchestrationItem {
                    instance: instance.clone(),
                    orchestration_name: name,
                    version,
                    execution_id: INITIAL_EXECUTION_ID,
                    history: Vec::new(),
                    messages,
                }
            }
        };

        tracing::debug!(
            target: "duralane::providers::in_memory",
            instance_id = %instance,
            messages = item.messages.len(),
            "Locked orchestration item"
        );
        Ok(Some((item, token)))
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
        let mut st = self.state.lock().await;
        let now = now_ms();

        let (instance, locked_until) = st
            .instance_locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(inst, l)| (inst.clone(), l.locked_until))
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;
        if locked_until <= now {
            return Err(ProviderError::permanent("ack_orchestration_item", "Instance lock expired"));
        }
        let lock = st
            .instance_locks
            .remove(&instance)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;

        if !history_delta.is_empty() || st.instances.contains_key(&instance) {
            let row = st.instances.entry(instance.clone()).or_insert_with(|| InstanceRow {
                orchestration_name: metadata.orchestration_name.clone().unwrap_or_default(),
                orchestration_version: metadata.orchestration_version.clone().unwrap_or_default(),
                current_execution_id: execution_id,
                status: "Running".to_string(),
                output: None,
                custom_status: None,
                custom_status_version: 0,
                executions: BTreeMap::new(),
            });
            if execution_id > row.current_execution_id {
                row.current_execution_id = execution_id;
            }
            let history = row.executions.entry(execution_id).or_default();
            let last_id = history.last().map(|e| e.event_id).unwrap_or(0);
            let appended: Vec<Event> = history_delta.into_iter().filter(|e| e.event_id > last_id).collect();
            history.extend(appended.iter().cloned());

            if let Some((status, count)) = custom_status_updates(&appended) {
                row.custom_status = status;
                row.custom_status_version += count;
            }
            if let Some(name) = metadata.orchestration_name {
                row.orchestration_name = name;
            }
            if let Some(version) = metadata.orchestration_version {
                row.orchestration_version = version;
            }
            match metadata.status.as_deref() {
                Some("Completed") | Some("Failed") => {
                    row.status = metadata.status.clone().unwrap_or_default();
                    row.output = metadata.output;
                }
                Some(_) => row.status = "Running".to_string(),
                None => {}
            }
        }

        for item in worker_items {
            st.push_worker(item, now);
        }
        for item in orchestrator_items {
            let visible_at = match &item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms,
                _ => now,
            };
            st.push_orchestrator(item, visible_at);
        }
        if !cancelled_activities.is_empty() {
            st.worker_queue
                .retain(|row| row.identity().is_none_or(|id| !cancelled_activities.contains(&id)));
        }
        st.orchestrator_queue.retain(|m| !lock.message_ids.contains(&m.id));
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let instance = st
            .instance_locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(inst, _)| inst.clone())
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "Invalid lock token"))?;
        let lock = st
            .instance_locks
            .remove(&instance)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "Invalid lock token"))?;
        if let Some(delay) = delay {
            let visible_at = now_ms() + delay.as_millis() as u64;
            for m in st.orchestrator_queue.iter_mut() {
                if lock.message_ids.contains(&m.id) {
                    m.visible_at = m.visible_at.max(visible_at);
                }
            }
        }
        Ok(())
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();
        let lock = st
            .instance_locks
            .values_mut()
            .find(|l| l.token == lock_token && l.locked_until > now)
            .ok_or_else(|| ProviderError::permanent("renew_orchestration_item_lock", "Lock not found or expired"))?;
        lock.locked_until = now + extend_for.as_millis() as u64;
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        st.push_orchestrator(item, visible_at);
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
        session: Option<&SessionFetchConfig>,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();
        let Some(idx) = st.next_work_row(now, session) else {
            return Ok(None);
        };
        let token = st.token("work");
        let row = &mut st.worker_queue[idx];
        row.lock_token = Some(token.clone());
        row.locked_until = now + lock_timeout.as_millis() as u64;
        let item = row.item.clone();

        if let (Some(sid), Some(cfg)) = (item.session_id(), session) {
            st.sessions.insert(
                sid.to_string(),
                SessionRow {
                    owner_id: cfg.owner_id.clone(),
                    locked_until: now + cfg.lock_timeout.as_millis() as u64,
                    last_activity_at: now,
                },
            );
        }
        Ok(Some((item, token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();
        let idx = st
            .worker_queue
            .iter()
            .position(|r| r.lock_token.as_deref() == Some(lock_token))
            .ok_or_else(|| {
                ProviderError::permanent("ack_work_item", "Activity was cancelled or its lock was lost")
            })?;
        let row = st.worker_queue.remove(idx);
        if let Some(sid) = row.item.session_id()
            && let Some(s) = st.sessions.get_mut(sid)
        {
            s.last_activity_at = now;
        }
        if let Some(completion) = completion {
            st.push_orchestrator(completion, now);
        }
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let row = st
            .worker_queue
            .iter_mut()
            .find(|r| r.lock_token.as_deref() == Some(lock_token))
            .ok_or_else(|| ProviderError::permanent("abandon_work_item", "Invalid lock token"))?;
        row.lock_token = None;
        row.locked_until = 0;
        row.visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        Ok(())
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();
        let row = st
            .worker_queue
            .iter_mut()
            .find(|r| r.lock_token.as_deref() == Some(lock_token))
            .ok_or_else(|| ProviderError::permanent("renew_work_item_lock", "Work item was cancelled or re-locked"))?;
        row.locked_until = now + extend_for.as_millis() as u64;
        Ok(())
    }

    async fn renew_session_lock(
        &self,
        owner_id: &str,
        session_ids: &[String],
        extend_for: Duration,
    ) -> Result<usize, ProviderError> {
        let mut st = self.state.lock().await;
        let until = now_ms() + extend_for.as_millis() as u64;
        let mut renewed = 0;
        for sid in session_ids {
            if let Some(s) = st.sessions.get_mut(sid)
                && s.owner_id == owner_id
            {
                s.locked_until = until;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn release_session(&self, owner_id: &str, session_id: &str) -> Result<bool, ProviderError> {
        let mut st = self.state.lock().await;
        let owned = st.sessions.get(session_id).is_some_and(|s| s.owner_id == owner_id);
        if !owned || st.session_has_items(session_id) {
            return Ok(false);
        }
        st.sessions.remove(session_id);
        Ok(true)
    }

    async fn cleanup_orphaned_sessions(&self) -> Result<usize, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_ms();
        let orphaned: Vec<String> = st
            .sessions
            .iter()
            .filter(|(sid, s)| s.locked_until <= now && !st.session_has_items(sid))
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in &orphaned {
            st.sessions.remove(sid);
        }
        Ok(orphaned.len())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .and_then(|row| row.executions.get(&row.current_execution_id).cloned())
            .unwrap_or_default())
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .and_then(|row| row.executions.get(&execution_id).cloned())
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st.instances.get(instance).map(|row| row.current_execution_id))
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st.instances.get(instance).map(|row| InstanceInfo {
            instance_id: instance.to_string(),
            orchestration_name: row.orchestration_name.clone(),
            orchestration_version: row.orchestration_version.clone(),
            current_execution_id: row.current_execution_id,
            status: row.status.clone(),
            output: row.output.clone(),
            custom_status: row.custom_status.clone(),
            custom_status_version: row.custom_status_version,
        }))
    }

    async fn get_custom_status(
        &self,
        instance: &str,
        since_version: u64,
    ) -> Result<Option<(Option<String>, u64)>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(instance)
            .filter(|row| row.custom_status_version > since_version)
            .map(|row| (row.custom_status.clone(), row.custom_status_version)))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let st = self.state.lock().await;
        let mut names: Vec<String> = st.instances.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn activity(instance: &str, id: u64, session: Option<&str>) -> WorkItem {
        WorkItem::ActivityExecute {
            instance: instance.to_string(),
            execution_id: 1,
            id,
            name: "A".to_string(),
            input: String::new(),
            session_id: session.map(str::to_string),
        }
    }

    fn session_cfg(owner: &str) -> SessionFetchConfig {
        SessionFetchConfig {
            owner_id: owner.to_string(),
            lock_timeout: Duration::from_secs(30),
            can_claim_new: true,
        }
    }

    async fn seed_instance(store: &InMemoryProvider, instance: &str, workers: Vec<WorkItem>) {
        store
            .enqueue_for_orchestrator(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: "O".to_string(),
                    version: Some("1.0.0".to_string()),
                    input: String::new(),
                },
                None,
            )
            .await
            .unwrap();
        let (_item, token) = store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let started = Event::with_event_id(
            1,
            instance,
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "O".into(),
                version: "1.0.0".into(),
                input: String::new(),
            },
        );
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started],
                workers,
                vec![],
                ExecutionMetadata {
                    status: Some("Running".into()),
                    orchestration_name: Some("O".into()),
                    orchestration_version: Some("1.0.0".into()),
                    ..Default::default()
                },
                vec![],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_items_are_serialized_in_fifo_order() {
        let store = InMemoryProvider::new();
        seed_instance(
            &store,
            "i1",
            vec![activity("i1", 2, Some("s")), activity("i1", 3, Some("s"))],
        )
        .await;
        let cfg = session_cfg("w1");

        let (first, t1) = store
            .fetch_work_item(Duration::from_secs(30), Some(&cfg))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, WorkItem::ActivityExecute { id: 2, .. }));
        assert!(
            store
                .fetch_work_item(Duration::from_secs(30), Some(&cfg))
                .await
                .unwrap()
                .is_none(),
            "second session item must wait for the first"
        );
        store.ack_work_item(&t1, None).await.unwrap();
        let (second, _) = store
            .fetch_work_item(Duration::from_secs(30), Some(&cfg))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, WorkItem::ActivityExecute { id: 3, .. }));
    }

    #[tokio::test]
    async fn session_owned_elsewhere_is_not_fetchable() {
        let store = InMemoryProvider::new();
        seed_instance(
            &store,
            "i1",
            vec![activity("i1", 2, Some("s")), activity("i1", 3, Some("s"))],
        )
        .await;
        let (_, t1) = store
            .fetch_work_item(Duration::from_secs(30), Some(&session_cfg("w1")))
            .await
            .unwrap()
            .unwrap();
        store.ack_work_item(&t1, None).await.unwrap();
        assert!(
            store
                .fetch_work_item(Duration::from_secs(30), Some(&session_cfg("w2")))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.release_session("w2", "s").await.unwrap() == false);
    }

    #[tokio::test]
    async fn cancelled_activity_row_is_stolen() {
        let store = InMemoryProvider::new();
        seed_instance(&store, "i1", vec![activity("i1", 2, None)]).await;
        let (_, token) = store
            .fetch_work_item(Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();

        store
            .enqueue_for_orchestrator(
                WorkItem::ExternalRaised {
                    instance: "i1".into(),
                    name: "poke".into(),
                    data: String::new(),
                },
                None,
            )
            .await
            .unwrap();
        let (_, orch_token) = store
            .fetch_orchestration_item(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store
            .ack_orchestration_item(
                &orch_token,
                1,
                vec![],
                vec![],
                vec![],
                ExecutionMetadata::default(),
                vec![ScheduledActivityIdentifier {
                    instance: "i1".into(),
                    execution_id: 1,
                    activity_id: 2,
                }],
            )
            .await
            .unwrap();

        assert!(store.renew_work_item_lock(&token, Duration::from_secs(5)).await.is_err());
        assert!(store.ack_work_item(&token, None).await.is_err());
    }

    #[tokio::test]
    async fn reacking_same_events_is_a_noop() {
        let store = InMemoryProvider::new();
        seed_instance(&store, "i1", vec![]).await;
        let status = Event::with_event_id(2, "i1", 1, None, EventKind::CustomStatusSet { status: Some("a".into()) });
        for _ in 0..2 {
            store
                .enqueue_for_orchestrator(
                    WorkItem::ExternalRaised {
                        instance: "i1".into(),
                        name: "x".into(),
                        data: String::new(),
                    },
                    None,
                )
                .await
                .unwrap();
            let (_, token) = store
                .fetch_orchestration_item(Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            store
                .ack_orchestration_item(
                    &token,
                    1,
                    vec![status.clone()],
                    vec![],
                    vec![],
                    ExecutionMetadata::default(),
                    vec![],
                )
                .await
                .unwrap();
        }
        assert_eq!(store.read("i1").await.unwrap().len(), 2);
        assert_eq!(
            store.get_custom_status("i1", 0).await.unwrap(),
            Some((Some("a".to_string()), 1))
        );
    }
}
