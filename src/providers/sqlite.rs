use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{
    ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, ProviderError, ScheduledActivityIdentifier,
    SessionFetchConfig, WorkItem, custom_status_updates,
};
use crate::{Event, INITIAL_EXECUTION_ID, now_ms};

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Tuning for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub max_connections: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// SQLite-backed provider. Every trait call runs in one transaction.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let msg = e.to_string();
        if msg.contains("database is locked") || msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {msg}"));
        }
        if msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {msg}"));
        }
        ProviderError::retryable(operation, msg)
    }

    /// Open (or create) a database.
    ///
    /// `database_url` is a sqlx SQLite URL such as `sqlite:/tmp/x.db?mode=rwc` or
    /// `sqlite::memory:`. The schema is created if missing.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Self::create_schema(&pool).await?;
        debug!(target: "duralane::providers::sqlite", url = %database_url, "Opened sqlite provider");
        Ok(Self { pool })
    }

    /// Fresh in-memory database shared by the pool's connections.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:?cache=shared", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                orchestration_version TEXT NOT NULL DEFAULT '',
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                custom_status TEXT,
                custom_status_version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, execution_id, event_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                instance_id TEXT,
                execution_id INTEGER,
                activity_id INTEGER,
                session_id TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)",
            "CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(lock_token, id)",
            "CREATE INDEX IF NOT EXISTS idx_worker_session ON worker_queue(session_id, id)",
            "CREATE INDEX IF NOT EXISTS idx_worker_identity ON worker_queue(instance_id, execution_id, activity_id)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(pool).await?;
        }
        Ok(())
    }

    fn generate_lock_token() -> String {
        format!(
            "lock_{}_{}_{}",
            now_ms(),
            std::process::id(),
            LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn now_millis() -> i64 {
        now_ms() as i64
    }

    fn timestamp_after(duration: Duration) -> i64 {
        Self::now_millis().saturating_add(duration.as_millis().min(i64::MAX as u128) as i64)
    }

    fn encode_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("Deserialization error: {e}")))
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ? AND execution_id = ? ORDER BY event_id",
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read", e))?;

        rows.iter()
            .map(|row| {
                let data: String = row
                    .try_get("event_data")
                    .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
                serde_json::from_str::<Event>(&data).map_err(|e| {
                    ProviderError::permanent("read", format!("Corrupt history row for '{instance}': {e}"))
                })
            })
            .collect()
    }

    async fn insert_orchestrator_item(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
        visible_at: i64,
    ) -> Result<(), ProviderError> {
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(item.instance())
            .bind(Self::encode_item(operation, item)?)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        const OP: &str = "fetch_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now = Self::now_millis();

        let instance_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some(instance_id) = instance_id else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let lock_token = Self::generate_lock_token();
        let acquired = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3, locked_at = ?4
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance_id)
        .bind(&lock_token)
        .bind(Self::timestamp_after(lock_timeout))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .rows_affected();
        if acquired == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Re-marking picks up messages left behind by an expired lock.
        sqlx::query("UPDATE orchestrator_queue SET lock_token = ?1 WHERE instance_id = ?2 AND visible_at <= ?3")
            .bind(&lock_token)
            .bind(&instance_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.try_get("work_item").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            messages.push(Self::decode_item(OP, &raw)?);
        }

        let info = sqlx::query(
            "SELECT orchestration_name, orchestration_version, current_execution_id FROM instances WHERE instance_id = ?",
        )
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let (orchestration_name, version, execution_id, history) = match info {
            Some(row) => {
                let name: String = row
                    .try_get("orchestration_name")
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                let version: String = row
                    .try_get("orchestration_version")
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                let exec: i64 = row
                    .try_get("current_execution_id")
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                let history = Self::read_history_in_tx(&mut tx, &instance_id, exec as u64).await?;
                (name, version, exec as u64, history)
            }
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
                (name, version, INITIAL_EXECUTION_ID, Vec::new())
            }
        };

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(
            target: "duralane::providers::sqlite",
            instance_id = %instance_id,
            messages = messages.len(),
            history_len = history.len(),
            "Fetched orchestration item"
        );
        Ok(Some((
            OrchestrationItem {
                instance: instance_id,
                orchestration_name,
                version,
                execution_id,
                history,
                messages,
            },
            lock_token,
        )))
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
        const OP: &str = "ack_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now = Self::now_millis();

        let instance_id: String = sqlx::query_scalar(
            "SELECT instance_id FROM instance_locks WHERE lock_token = ? AND locked_until > ?",
        )
        .bind(lock_token)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .ok_or_else(|| ProviderError::permanent(OP, "Invalid or expired lock token"))?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM instances WHERE instance_id = ?")
            .bind(&instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if exists.is_some() || !history_delta.is_empty() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO instances
                (instance_id, orchestration_name, orchestration_version, current_execution_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&instance_id)
            .bind(metadata.orchestration_name.clone().unwrap_or_default())
            .bind(metadata.orchestration_version.clone().unwrap_or_default())
            .bind(execution_id as i64)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

            sqlx::query(
                r#"
                UPDATE instances
                SET orchestration_name = COALESCE(?1, orchestration_name),
                    orchestration_version = COALESCE(?2, orchestration_version),
                    current_execution_id = MAX(current_execution_id, ?3)
                WHERE instance_id = ?4
                "#,
            )
            .bind(&metadata.orchestration_name)
            .bind(&metadata.orchestration_version)
            .bind(execution_id as i64)
            .bind(&instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

            sqlx::query("INSERT OR IGNORE INTO executions (instance_id, execution_id) VALUES (?, ?)")
                .bind(&instance_id)
                .bind(execution_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

            let last_event_id: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(event_id), 0) FROM history WHERE instance_id = ? AND execution_id = ?",
            )
            .bind(&instance_id)
            .bind(execution_id as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

            let appended: Vec<Event> = history_delta
                .into_iter()
                .filter(|e| e.event_id as i64 > last_event_id)
                .collect();
            for event in &appended {
                let data = serde_json::to_string(event)
                    .map_err(|e| ProviderError::permanent(OP, format!("Serialization error: {e}")))?;
                sqlx::query(
                    "INSERT INTO history (instance_id, execution_id, event_id, event_type, event_data) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&instance_id)
                .bind(execution_id as i64)
                .bind(event.event_id as i64)
                .bind(event.kind.name())
                .bind(data)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }

            if let Some((status, count)) = custom_status_updates(&appended) {
                sqlx::query(
                    "UPDATE instances SET custom_status = ?, custom_status_version = custom_status_version + ? WHERE instance_id = ?",
                )
                .bind(status)
                .bind(count as i64)
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }

            if let Some(status) = &metadata.status {
                sqlx::query("UPDATE executions SET status = ?, output = ? WHERE instance_id = ? AND execution_id = ?")
                    .bind(status)
                    .bind(&metadata.output)
                    .bind(&instance_id)
                    .bind(execution_id as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                let (instance_status, output) = match status.as_str() {
                    "Completed" | "Failed" => (status.as_str(), metadata.output.clone()),
                    _ => ("Running", None),
                };
                sqlx::query("UPDATE instances SET status = ?, output = ? WHERE instance_id = ?")
                    .bind(instance_status)
                    .bind(output)
                    .bind(&instance_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
        }

        for item in &worker_items {
            let (inst, exec, activity_id, session_id) = match item {
                WorkItem::ActivityExecute {
                    instance,
                    execution_id,
                    id,
                    session_id,
                    ..
                } => (
                    Some(instance.as_str()),
                    Some(*execution_id as i64),
                    Some(*id as i64),
                    session_id.as_deref(),
                ),
                _ => (None, None, None, None),
            };
            sqlx::query(
                r#"
                INSERT INTO worker_queue (work_item, visible_at, instance_id, execution_id, activity_id, session_id)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Self::encode_item(OP, item)?)
            .bind(now)
            .bind(inst)
            .bind(exec)
            .bind(activity_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        for item in &orchestrator_items {
            let visible_at = match item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms as i64,
                _ => now,
            };
            Self::insert_orchestrator_item(&mut tx, OP, item, visible_at).await?;
        }

        if !cancelled_activities.is_empty() {
            debug!(
                target: "duralane::providers::sqlite",
                instance_id = %instance_id,
                count = cancelled_activities.len(),
                "Deleting cancelled activities"
            );
            for activity in &cancelled_activities {
                sqlx::query("DELETE FROM worker_queue WHERE instance_id = ? AND execution_id = ? AND activity_id = ?")
                    .bind(&activity.instance)
                    .bind(activity.execution_id as i64)
                    .bind(activity.activity_id as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
        }

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
            .bind(&instance_id)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(target: "duralane::providers::sqlite", instance_id = %instance_id, execution_id, "Acked orchestration item");
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let instance_id: String = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .ok_or_else(|| ProviderError::permanent(OP, "Invalid lock token"))?;

        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if let Some(delay) = delay {
            sqlx::query("UPDATE orchestrator_queue SET visible_at = MAX(visible_at, ?) WHERE lock_token = ?")
                .bind(Self::timestamp_after(delay))
                .bind(lock_token)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(target: "duralane::providers::sqlite", instance_id = %instance_id, ?delay, "Abandoned orchestration item");
        Ok(())
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let result = sqlx::query("UPDATE instance_locks SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(Self::timestamp_after(extend_for))
            .bind(lock_token)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew_orchestration_item_lock", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "renew_orchestration_item_lock",
                "Lock token invalid, expired, or already acked",
            ));
        }
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "enqueue_for_orchestrator";
        let visible_at = delay.map(Self::timestamp_after).unwrap_or_else(Self::now_millis);
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::insert_orchestrator_item(&mut tx, OP, &item, visible_at).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(target: "duralane::providers::sqlite", instance_id = %item.instance(), kind = item.kind(), ?delay, "Enqueued orchestrator item");
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
        session: Option<&SessionFetchConfig>,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        const OP: &str = "fetch_work_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now = Self::now_millis();
        let owner = session.map(|s| s.owner_id.as_str());
        let can_claim_new = session.is_some_and(|s| s.can_claim_new);

        // A session item is eligible only as the head of its session, with no sibling
        // locked, and when the session is ours or claimable.
        let row = sqlx::query(
            r#"
            SELECT w.id, w.work_item, w.session_id
            FROM worker_queue w
            LEFT JOIN sessions s ON s.session_id = w.session_id
            WHERE w.visible_at <= ?1
              AND (w.lock_token IS NULL OR w.locked_until <= ?1)
              AND (
                w.session_id IS NULL
                OR (
                  ?2 IS NOT NULL
                  AND w.id = (SELECT MIN(h.id) FROM worker_queue h WHERE h.session_id = w.session_id)
                  AND NOT EXISTS (
                    SELECT 1 FROM worker_queue l
                    WHERE l.session_id = w.session_id AND l.lock_token IS NOT NULL AND l.locked_until > ?1
                  )
                  AND (
                    s.owner_id = ?2
                    OR ((s.session_id IS NULL OR s.locked_until <= ?1) AND ?3 = 1)
                  )
                )
              )
            ORDER BY w.id
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(owner)
        .bind(can_claim_new as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let raw: String = row.try_get("work_item").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let session_id: Option<String> = row.try_get("session_id").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let lock_token = Self::generate_lock_token();
        let locked = sqlx::query(
            r#"
            UPDATE worker_queue SET lock_token = ?1, locked_until = ?2
            WHERE id = ?3 AND (lock_token IS NULL OR locked_until <= ?4)
            "#,
        )
        .bind(&lock_token)
        .bind(Self::timestamp_after(lock_timeout))
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .rows_affected();
        if locked == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        if let (Some(sid), Some(cfg)) = (&session_id, session) {
            sqlx::query(
                r#"
                INSERT INTO sessions (session_id, owner_id, locked_until, last_activity_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id) DO UPDATE
                SET owner_id = ?2, locked_until = ?3, last_activity_at = ?4
                "#,
            )
            .bind(sid)
            .bind(&cfg.owner_id)
            .bind(Self::timestamp_after(cfg.lock_timeout))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }

        let item = Self::decode_item(OP, &raw)?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(Some((item, lock_token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        const OP: &str = "ack_work_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now = Self::now_millis();

        let row = sqlx::query("SELECT id, session_id FROM worker_queue WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .ok_or_else(|| ProviderError::permanent(OP, "Activity was cancelled or its lock was lost"))?;
        let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let session_id: Option<String> = row.try_get("session_id").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        sqlx::query("DELETE FROM worker_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if let Some(sid) = &session_id {
            sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE session_id = ?")
                .bind(now)
                .bind(sid)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }
        if let Some(completion) = &completion {
            Self::insert_orchestrator_item(&mut tx, OP, completion, now).await?;
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let visible_at = delay.map(Self::timestamp_after).unwrap_or_else(Self::now_millis);
        let result = sqlx::query(
            "UPDATE worker_queue SET lock_token = NULL, locked_until = NULL, visible_at = ?1 WHERE lock_token = ?2",
        )
        .bind(visible_at)
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("abandon_work_item", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "Invalid lock token or already acked",
            ));
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let result = sqlx::query("UPDATE worker_queue SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(Self::timestamp_after(extend_for))
            .bind(lock_token)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew_work_item_lock", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "renew_work_item_lock",
                "Activity was cancelled or lock expired",
            ));
        }
        Ok(())
    }

    async fn renew_session_lock(
        &self,
        owner_id: &str,
        session_ids: &[String],
        extend_for: Duration,
    ) -> Result<usize, ProviderError> {
        const OP: &str = "renew_session_lock";
        if session_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let until = Self::timestamp_after(extend_for);
        let mut renewed = 0usize;
        for sid in session_ids {
            renewed += sqlx::query("UPDATE sessions SET locked_until = ? WHERE session_id = ? AND owner_id = ?")
                .bind(until)
                .bind(sid)
                .bind(owner_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
                .rows_affected() as usize;
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Ok(renewed)
    }

    async fn release_session(&self, owner_id: &str, session_id: &str) -> Result<bool, ProviderError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE session_id = ?1 AND owner_id = ?2
              AND NOT EXISTS (SELECT 1 FROM worker_queue w WHERE w.session_id = ?1)
            "#,
        )
        .bind(session_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("release_session", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_orphaned_sessions(&self) -> Result<usize, ProviderError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE locked_until <= ?1
              AND NOT EXISTS (SELECT 1 FROM worker_queue w WHERE w.session_id = sessions.session_id)
            "#,
        )
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("cleanup_orphaned_sessions", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let Some(execution_id) = self.latest_execution_id(instance).await? else {
            return Ok(Vec::new());
        };
        self.read_with_execution(instance, execution_id).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        let events = Self::read_history_in_tx(&mut tx, instance, execution_id).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Ok(events)
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT current_execution_id FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("latest_execution_id", e))?;
        Ok(id.map(|id| id as u64))
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        const OP: &str = "get_instance_info";
        let row = sqlx::query(
            r#"
            SELECT orchestration_name, orchestration_version, current_execution_id, status, output,
                   custom_status, custom_status_version
            FROM instances WHERE instance_id = ?
            "#,
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let get = |e: sqlx::Error| Self::sqlx_to_provider_error(OP, e);
        Ok(Some(InstanceInfo {
            instance_id: instance.to_string(),
            orchestration_name: row.try_get("orchestration_name").map_err(get)?,
            orchestration_version: row.try_get("orchestration_version").map_err(get)?,
            current_execution_id: row.try_get::<i64, _>("current_execution_id").map_err(get)? as u64,
            status: row.try_get("status").map_err(get)?,
            output: row.try_get("output").map_err(get)?,
            custom_status: row.try_get("custom_status").map_err(get)?,
            custom_status_version: row.try_get::<i64, _>("custom_status_version").map_err(get)? as u64,
        }))
    }

    async fn get_custom_status(
        &self,
        instance: &str,
        since_version: u64,
    ) -> Result<Option<(Option<String>, u64)>, ProviderError> {
        let row: Option<(Option<String>, i64)> = sqlx::query_as(
            "SELECT custom_status, custom_status_version FROM instances WHERE instance_id = ? AND custom_status_version > ?",
        )
        .bind(instance)
        .bind(since_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_custom_status", e))?;
        Ok(row.map(|(status, version)| (status, version as u64)))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }
}
