//! PostgreSQL-backed implementation of every store trait in [`crate::store`].
//!
//! [`PgStore::claim_next`] is the one query worth reading carefully: it
//! encodes target exclusivity and implicit pause directly in the `WHERE`
//! clause of a `FOR UPDATE SKIP LOCKED` CTE, then layers a transactional
//! advisory lock on top so that two workers racing on the same
//! `(tenant_schema, target_id)` never both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orc_engine::StoreError;
use sqlx::{postgres::PgConnection, postgres::PgRow, Connection, PgPool, Row};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::model::*;
use crate::store::*;

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

/// A tenant-scoped handle: every query is run with `search_path` set to the
/// tenant's schema so that rows from one tenant can never leak into another.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tenant_schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, tenant_schema: impl Into<String>) -> Self {
        Self {
            pool,
            tenant_schema: tenant_schema.into(),
        }
    }

    /// Deterministic lock key for this tenant's target, matching §6:
    /// `hash(tenant_schema || ':' || target_id)`.
    fn target_lock_key(&self, target_id: Uuid) -> i64 {
        lock_key(&format!("{}:{}", self.tenant_schema, target_id))
    }
}

/// `hashtext`-equivalent 64-bit key for `pg_try_advisory_xact_lock`.
///
/// Matches Postgres's own string-hash semantics closely enough for our
/// purposes: a stable, well-distributed i64 derived from the input.
fn lock_key(input: &str) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish() as i64
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Paused => "paused",
        JobStatus::Success => "success",
        JobStatus::Error => "error",
        JobStatus::Canceled => "canceled",
    }
}

fn parse_job_status(raw: &str) -> JobStatus {
    match raw {
        "pending" => JobStatus::Pending,
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "paused" => JobStatus::Paused,
        "success" => JobStatus::Success,
        "error" => JobStatus::Error,
        "canceled" => JobStatus::Canceled,
        other => panic!("unknown job status in database: {other}"),
    }
}

fn row_to_job(row: PgRow) -> Job {
    Job {
        id: row.get("id"),
        target_id: row.get("target_id"),
        session_id: row.get("session_id"),
        api_name: row.get("api_name"),
        api_definition_version_id: row.get("api_definition_version_id"),
        parameters: row.get("parameters"),
        status: parse_job_status(row.get::<String, _>("status").as_str()),
        result: row.get("result"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
        total_input_tokens: row.get("total_input_tokens"),
        total_output_tokens: row.get("total_output_tokens"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        cancel_requested: row.get("cancel_requested"),
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(row_to_job))
    }

    async fn enqueue(&self, target_id: Uuid, api_name: String, parameters: serde_json::Value) -> Result<Job> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, target_id, api_name, parameters, status, created_at, updated_at, cancel_requested)
            VALUES ($1, $2, $3, $4, 'queued', NOW(), NOW(), false)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(target_id)
        .bind(&api_name)
        .bind(&parameters)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row_to_job(row))
    }

    async fn claim_next(&self, lease_owner: &str, lease_seconds: i64) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Candidate: oldest queued job whose target has neither a running
        // job nor any paused/error (blocking) job. Tie-break on (created_at, id).
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT j.id, j.target_id
                FROM jobs j
                WHERE j.status = 'queued'
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs b
                      WHERE b.target_id = j.target_id
                        AND b.status IN ('running', 'paused', 'error')
                  )
                ORDER BY j.created_at, j.id
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            SELECT id, target_id FROM candidate
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(candidate) = row else {
            tx.commit().await.map_err(backend)?;
            return Ok(None);
        };

        let job_id: Uuid = candidate.get("id");
        let target_id: Uuid = candidate.get("target_id");

        let lock_key = self.target_lock_key(target_id);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(lock_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;

        if !acquired {
            // Another worker already owns this target this tick.
            tx.rollback().await.map_err(backend)?;
            return Ok(None);
        }

        let lease_expires_at = Utc::now() + chrono::Duration::seconds(lease_seconds);
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', lease_owner = $2, lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(lease_owner)
        .bind(lease_expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        debug!(job_id = %job_id, target_id = %target_id, lease_owner, "claimed job");
        Ok(Some(row_to_job(row)))
    }

    async fn renew_lease(&self, job_id: Uuid, owner: &str, extra_seconds: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($3 || ' seconds')::INTERVAL
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(extra_seconds.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_stale_leases(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'error',
                error = 'Lease expired; worker likely terminated',
                lease_owner = NULL,
                lease_expires_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE status = 'running'
              AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET cancel_requested = true, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn resume(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', error = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ('paused', 'error')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn resolve(&self, job_id: Uuid, result: serde_json::Value) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'success', result = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('paused', 'error')
            "#,
        )
        .bind(job_id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn terminate(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                error = $3,
                result = COALESCE($4, result),
                lease_owner = NULL,
                lease_expires_at = NULL,
                completed_at = CASE WHEN $2 IN ('success', 'error', 'canceled') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(job_status_str(status))
        .bind(error)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn bind_session(&self, job_id: Uuid, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET session_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn add_token_usage(&self, job_id: Uuid, input_tokens: i64, output_tokens: i64) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET total_input_tokens = COALESCE(total_input_tokens, 0) + $2,
                total_output_tokens = COALESCE(total_output_tokens, 0) + $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING total_input_tokens, total_output_tokens
            "#,
        )
        .bind(job_id)
        .bind(input_tokens)
        .bind(output_tokens)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok((row.get("total_input_tokens"), row.get("total_output_tokens")))
    }

    async fn blocking_jobs_for_target(&self, target_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE target_id = $1 AND status IN ('paused', 'error')")
            .bind(target_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(row_to_job).collect())
    }

    async fn has_queued_jobs(&self, _tenant_id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let cancel: bool = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(cancel)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, job_id: Uuid, role: MessageRole, content: serde_json::Value) -> Result<JobMessage> {
        let role_str = match role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        // Dense, monotonic sequence per job under a single write: compute
        // next = max(sequence)+1 inside the same statement that inserts it.
        let row = sqlx::query(
            r#"
            INSERT INTO job_messages (id, job_id, sequence, role, message_content, created_at)
            VALUES (
                $1, $2,
                COALESCE((SELECT MAX(sequence) FROM job_messages WHERE job_id = $2), 0) + 1,
                $3, $4, NOW()
            )
            RETURNING id, job_id, sequence, role, message_content, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(role_str)
        .bind(&content)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(JobMessage {
            id: row.get("id"),
            job_id: row.get("job_id"),
            sequence: row.get("sequence"),
            role,
            message_content: row.get("message_content"),
            created_at: row.get("created_at"),
        })
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobMessage>> {
        let rows = sqlx::query(
            "SELECT id, job_id, sequence, role, message_content, created_at FROM job_messages WHERE job_id = $1 ORDER BY sequence ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| JobMessage {
                id: row.get("id"),
                job_id: row.get("job_id"),
                sequence: row.get("sequence"),
                role: match row.get::<String, _>("role").as_str() {
                    "user" => MessageRole::User,
                    _ => MessageRole::Assistant,
                },
                message_content: row.get("message_content"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// Replace base64 image payloads with a sentinel so dashboards reading
/// `content_trimmed` never ship raw screenshot bytes.
fn trim_images(content: &str) -> String {
    const SENTINEL: &str = "[image omitted]";
    // Images are embedded as `data:image/...;base64,<...>` strings inside
    // the JSON content; collapse anything matching that prefix.
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(idx) = rest.find("base64,") {
        out.push_str(&rest[..idx]);
        out.push_str(SENTINEL);
        let after = &rest[idx + "base64,".len()..];
        let end = after.find('"').unwrap_or(after.len());
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl LogStore for PgStore {
    async fn append(&self, job_id: Uuid, log_type: LogType, content: String) -> Result<JobLog> {
        let log_type_str = match log_type {
            LogType::System => "system",
            LogType::HttpExchange => "http_exchange",
            LogType::ToolUse => "tool_use",
            LogType::Message => "message",
            LogType::Result => "result",
            LogType::Error => "error",
        };
        let trimmed = trim_images(&content);
        let row = sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, timestamp, log_type, content, content_trimmed)
            VALUES ($1, $2, NOW(), $3, $4, $5)
            RETURNING id, job_id, timestamp, log_type, content, content_trimmed
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(log_type_str)
        .bind(&content)
        .bind(&trimmed)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(JobLog {
            id: row.get("id"),
            job_id: row.get("job_id"),
            timestamp: row.get("timestamp"),
            log_type,
            content: row.get("content"),
            content_trimmed: row.get("content_trimmed"),
        })
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobLog>> {
        let rows = sqlx::query(
            "SELECT id, job_id, timestamp, log_type, content, content_trimmed FROM job_logs WHERE job_id = $1 ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| JobLog {
                id: row.get("id"),
                job_id: row.get("job_id"),
                timestamp: row.get("timestamp"),
                log_type: match row.get::<String, _>("log_type").as_str() {
                    "system" => LogType::System,
                    "http_exchange" => LogType::HttpExchange,
                    "tool_use" => LogType::ToolUse,
                    "message" => LogType::Message,
                    "result" => LogType::Result,
                    _ => LogType::Error,
                },
                content: row.get("content"),
                content_trimmed: row.get("content_trimmed"),
            })
            .collect())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(row_to_session))
    }

    async fn create_initializing(&self, target_id: Uuid) -> Result<Session> {
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (id, target_id, state, status, is_archived, created_at, updated_at)
            VALUES ($1, $2, 'initializing', 'starting', false, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(target_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row_to_session(row))
    }

    async fn update(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET state = $2, status = $3, container_id = $4, container_ip = $5,
                is_archived = $6, archive_reason = $7, last_job_time = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session_state_str(session.state))
        .bind(&session.status)
        .bind(&session.container_id)
        .bind(&session.container_ip)
        .bind(session.is_archived)
        .bind(session.archive_reason.map(archive_reason_str))
        .bind(session.last_job_time)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_non_archived(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE is_archived = false")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(row_to_session).collect())
    }

    async fn find_ready_for_target(&self, target_id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE target_id = $1 AND state = 'ready' AND is_archived = false LIMIT 1",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(row_to_session))
    }

    async fn has_initializing_for_target(&self, target_id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE target_id = $1 AND state = 'initializing' AND is_archived = false",
        )
        .bind(target_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(count > 0)
    }
}

fn session_state_str(state: SessionState) -> &'static str {
    match state {
        SessionState::Initializing => "initializing",
        SessionState::Authenticating => "authenticating",
        SessionState::Ready => "ready",
        SessionState::Destroying => "destroying",
        SessionState::Destroyed => "destroyed",
    }
}

fn archive_reason_str(reason: ArchiveReason) -> &'static str {
    match reason {
        ArchiveReason::UserInitiated => "user-initiated",
        ArchiveReason::AutoCleanup => "auto-cleanup",
    }
}

fn row_to_session(row: PgRow) -> Session {
    Session {
        id: row.get("id"),
        target_id: row.get("target_id"),
        state: match row.get::<String, _>("state").as_str() {
            "initializing" => SessionState::Initializing,
            "authenticating" => SessionState::Authenticating,
            "ready" => SessionState::Ready,
            "destroying" => SessionState::Destroying,
            _ => SessionState::Destroyed,
        },
        status: row.get("status"),
        container_id: row.get("container_id"),
        container_ip: row.get("container_ip"),
        is_archived: row.get("is_archived"),
        archive_reason: row
            .get::<Option<String>, _>("archive_reason")
            .map(|s| if s == "user-initiated" { ArchiveReason::UserInitiated } else { ArchiveReason::AutoCleanup }),
        last_job_time: row.get("last_job_time"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn get_by_host(&self, host: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE host = $1")
            .bind(host)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(row_to_tenant))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(row_to_tenant))
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants WHERE is_active = true")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(row_to_tenant).collect())
    }
}

fn row_to_tenant(row: PgRow) -> Tenant {
    Tenant {
        id: row.get("id"),
        name: row.get("name"),
        host: row.get("host"),
        schema: row.get("schema"),
        is_active: row.get("is_active"),
        clerk_user_id: row.get("clerk_user_id"),
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Target>> {
        let row = sqlx::query("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|row: PgRow| Target {
            id: row.get("id"),
            name: row.get("name"),
            r#type: row.get("type"),
            host: row.get("host"),
            port: row.get::<Option<i32>, _>("port").map(|p| p as u16),
            username: row.get("username"),
            password: row.get("password"),
            vpn_config: row.get("vpn_config"),
            vpn_username: row.get("vpn_username"),
            vpn_password: row.get("vpn_password"),
            width: row.get::<i32, _>("width") as u32,
            height: row.get::<i32, _>("height") as u32,
            rdp_params: row.get("rdp_params"),
            is_archived: row.get("is_archived"),
        }))
    }
}

#[async_trait]
impl ApiDefinitionStore for PgStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<ApiDefinition>> {
        let row = sqlx::query("SELECT * FROM api_definitions WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|row: PgRow| ApiDefinition {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            is_archived: row.get("is_archived"),
        }))
    }

    async fn get_active_version(&self, api_definition_id: Uuid) -> Result<Option<ApiDefinitionVersion>> {
        let row = sqlx::query(
            "SELECT * FROM api_definition_versions WHERE api_definition_id = $1 AND is_active = true LIMIT 1",
        )
        .bind(api_definition_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(row_to_version))
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<ApiDefinitionVersion>> {
        let row = sqlx::query("SELECT * FROM api_definition_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(row_to_version))
    }
}

fn row_to_version(row: PgRow) -> ApiDefinitionVersion {
    let parameters: serde_json::Value = row.get("parameters");
    ApiDefinitionVersion {
        id: row.get("id"),
        api_definition_id: row.get("api_definition_id"),
        version_number: row.get("version_number"),
        parameters: serde_json::from_value(parameters).unwrap_or_default(),
        prompt: row.get("prompt"),
        prompt_cleanup: row.get("prompt_cleanup"),
        response_example: row.get("response_example"),
        is_active: row.get("is_active"),
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get(&self, tenant_id: Uuid, key: SettingsKey) -> Result<Option<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT value FROM tenant_settings WHERE tenant_id = $1 AND key = $2",
        )
        .bind(tenant_id)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.or_else(|| key.default_value().map(str::to_string)))
    }

    async fn set(&self, tenant_id: Uuid, key: SettingsKey, value: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_settings (tenant_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(tenant_id)
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

/// Holds the `hash("maintenance_v1")` session-level advisory lock on one
/// dedicated connection for the life of the process, per §4.8. A pool-backed
/// handle cannot do this: `sqlx::PgPool` hands out an arbitrary connection
/// per query and can recycle or close it between calls, which silently
/// drops a session-level advisory lock out from under whoever thinks they
/// still hold it. This connection is opened outside any pool and never
/// returned to one.
pub struct PgMaintenanceLock {
    conn: Mutex<PgConnection>,
}

impl PgMaintenanceLock {
    pub async fn connect(database_url: &str) -> sqlx::Result<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl AdvisoryLocks for PgMaintenanceLock {
    async fn try_become_maintenance_leader(&self) -> Result<bool> {
        let key = lock_key("maintenance_v1");
        let mut conn = self.conn.lock().await;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(backend)?;
        debug!(acquired, "maintenance leader election result");
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable() {
        assert_eq!(lock_key("maintenance_v1"), lock_key("maintenance_v1"));
        assert_ne!(lock_key("a:1"), lock_key("a:2"));
    }
}
