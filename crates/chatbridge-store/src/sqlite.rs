use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use chatbridge_protocol::{
    BrokerError, BrokerResult, Job, JobStatus, PermissionMode, SessionKey, SessionStore,
    StreamEvent, StreamKind,
};

const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_key TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    thread_id TEXT NOT NULL DEFAULT '',
    workdir TEXT NOT NULL DEFAULT '',
    context_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL,
    expires_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    session_key TEXT NOT NULL,
    executor TEXT NOT NULL,
    prompt TEXT NOT NULL,
    workdir TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    error_message TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_jobs_session_key ON jobs(session_key);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    chunk TEXT NOT NULL,
    stream TEXT NOT NULL,
    is_final INTEGER NOT NULL DEFAULT 0,
    ts TEXT NOT NULL,
    exit_code INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_job_id_seq ON events(job_id, seq);

CREATE TABLE IF NOT EXISTS executor_sessions (
    executor TEXT NOT NULL,
    platform TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    thread_id TEXT NOT NULL DEFAULT '',
    workdir TEXT NOT NULL,
    session_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (executor, platform, chat_id, thread_id, workdir)
);
CREATE INDEX IF NOT EXISTS idx_executor_sessions_updated_at ON executor_sessions(updated_at);
";

/// Read-back view of one job row, used for status inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: String,
    pub session_key: String,
    pub executor: String,
    pub prompt: String,
    pub workdir: String,
    pub status: JobStatus,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub error_message: String,
}

/// One logical connection, serialized behind a mutex. Every operation is
/// individually atomic; cross-operation ordering is the dispatcher's job.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let conn = Connection::open(path)
            .map_err(|err| BrokerError::Persistence(format!("open sqlite: {err}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn in_memory() -> BrokerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| BrokerError::Persistence(format!("open sqlite: {err}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    fn bootstrap(&self) -> BrokerResult<()> {
        self.lock_conn()
            .execute_batch(INIT_SQL)
            .map_err(|err| BrokerError::Persistence(format!("run migration: {err}")))
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    pub fn upsert_session(
        &self,
        key: &SessionKey,
        workdir: &str,
        expires_at: OffsetDateTime,
    ) -> BrokerResult<()> {
        self.lock_conn()
            .execute(
                "
                INSERT INTO sessions (session_key, platform, chat_id, thread_id, workdir, updated_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(session_key) DO UPDATE SET
                    workdir = excluded.workdir,
                    updated_at = excluded.updated_at,
                    expires_at = excluded.expires_at
                ",
                params![
                    key.to_string(),
                    key.platform.as_str(),
                    key.chat_id,
                    key.thread_id,
                    workdir,
                    to_rfc3339(OffsetDateTime::now_utc())?,
                    to_rfc3339(expires_at)?,
                ],
            )
            .map_err(|err| BrokerError::Persistence(format!("upsert session: {err}")))?;
        Ok(())
    }

    /// Empty string when the session row is absent; absence is not an error.
    pub fn session_workdir(&self, key: &SessionKey) -> BrokerResult<String> {
        self.lock_conn()
            .query_row(
                "SELECT workdir FROM sessions WHERE session_key = ?1",
                params![key.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|workdir| workdir.unwrap_or_default())
            .map_err(|err| BrokerError::Persistence(format!("get session workdir: {err}")))
    }

    pub fn session_permission_mode(&self, key: &SessionKey) -> BrokerResult<PermissionMode> {
        let context_json = self
            .lock_conn()
            .query_row(
                "SELECT context_json FROM sessions WHERE session_key = ?1",
                params![key.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| BrokerError::Persistence(format!("get session permission mode: {err}")))?;

        let Some(context_json) = context_json else {
            return Ok(PermissionMode::Sandbox);
        };
        if context_json.trim().is_empty() {
            return Ok(PermissionMode::Sandbox);
        }
        let payload: Map<String, Value> = serde_json::from_str(&context_json)
            .map_err(|err| BrokerError::Persistence(format!("decode session context_json: {err}")))?;
        let mode = payload
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(PermissionMode::normalize(mode))
    }

    /// Read-modify-write of `context_json`, preserving keys other than `mode`.
    pub fn set_session_permission_mode(
        &self,
        key: &SessionKey,
        mode: PermissionMode,
        expires_at: OffsetDateTime,
    ) -> BrokerResult<()> {
        let conn = self.lock_conn();
        let existing = conn
            .query_row(
                "SELECT workdir, context_json FROM sessions WHERE session_key = ?1",
                params![key.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| {
                BrokerError::Persistence(format!("load session for permission mode update: {err}"))
            })?;
        let (workdir, context_json) = existing.unwrap_or_default();

        let mut payload: Map<String, Value> = if context_json.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&context_json).map_err(|err| {
                BrokerError::Persistence(format!("decode session context_json: {err}"))
            })?
        };
        payload.insert("mode".to_owned(), Value::String(mode.as_str().to_owned()));
        let context_json = serde_json::to_string(&payload)
            .map_err(|err| BrokerError::Persistence(format!("encode session context_json: {err}")))?;

        conn.execute(
            "
            INSERT INTO sessions (session_key, platform, chat_id, thread_id, workdir, context_json, updated_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(session_key) DO UPDATE SET
                context_json = excluded.context_json,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            ",
            params![
                key.to_string(),
                key.platform.as_str(),
                key.chat_id,
                key.thread_id,
                workdir,
                context_json,
                to_rfc3339(OffsetDateTime::now_utc())?,
                to_rfc3339(expires_at)?,
            ],
        )
        .map_err(|err| BrokerError::Persistence(format!("set session permission mode: {err}")))?;
        Ok(())
    }

    pub fn create_job(&self, job: &Job) -> BrokerResult<()> {
        self.lock_conn()
            .execute(
                "
                INSERT INTO jobs (id, session_key, executor, prompt, workdir, status, created_at, error_message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    job.id,
                    job.session_key.to_string(),
                    job.executor,
                    job.prompt,
                    job.workdir,
                    job.status.as_str(),
                    to_rfc3339(job.created_at)?,
                    job.error_message,
                ],
            )
            .map_err(|err| BrokerError::Persistence(format!("create job: {err}")))?;
        Ok(())
    }

    pub fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        started_at: Option<OffsetDateTime>,
        finished_at: Option<OffsetDateTime>,
        error_message: &str,
    ) -> BrokerResult<()> {
        self.lock_conn()
            .execute(
                "
                UPDATE jobs
                SET status = ?1, started_at = ?2, finished_at = ?3, error_message = ?4
                WHERE id = ?5
                ",
                params![
                    status.as_str(),
                    started_at.map(to_rfc3339).transpose()?,
                    finished_at.map(to_rfc3339).transpose()?,
                    error_message,
                    job_id,
                ],
            )
            .map_err(|err| BrokerError::Persistence(format!("update job status: {err}")))?;
        Ok(())
    }

    pub fn append_event(&self, event: &StreamEvent) -> BrokerResult<()> {
        self.lock_conn()
            .execute(
                "
                INSERT INTO events (job_id, seq, chunk, stream, is_final, ts, exit_code)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    event.job_id,
                    event.seq,
                    event.chunk,
                    event.stream.as_str(),
                    event.is_final,
                    to_rfc3339(event.ts)?,
                    event.exit_code,
                ],
            )
            .map_err(|err| BrokerError::Persistence(format!("append event: {err}")))?;
        Ok(())
    }

    pub fn find_job(&self, job_id: &str) -> BrokerResult<Option<JobSnapshot>> {
        let row = self
            .lock_conn()
            .query_row(
                "
                SELECT id, session_key, executor, prompt, workdir, status, created_at, started_at, finished_at, error_message
                FROM jobs
                WHERE id = ?1
                ",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| BrokerError::Persistence(format!("find job: {err}")))?;

        let Some((
            id,
            session_key,
            executor,
            prompt,
            workdir,
            status,
            created_at,
            started_at,
            finished_at,
            error_message,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(JobSnapshot {
            id,
            session_key,
            executor,
            prompt,
            workdir,
            status: parse_job_status(&status)?,
            created_at: parse_rfc3339(&created_at)?,
            started_at: started_at.as_deref().map(parse_rfc3339).transpose()?,
            finished_at: finished_at.as_deref().map(parse_rfc3339).transpose()?,
            error_message,
        }))
    }

    pub fn session_jobs(&self, key: &SessionKey) -> BrokerResult<Vec<JobSnapshot>> {
        let ids: Vec<String> = {
            let conn = self.lock_conn();
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM jobs WHERE session_key = ?1 ORDER BY created_at ASC, id ASC",
                )
                .map_err(|err| BrokerError::Persistence(format!("list session jobs: {err}")))?;
            let rows = stmt
                .query_map(params![key.to_string()], |row| row.get::<_, String>(0))
                .map_err(|err| BrokerError::Persistence(format!("list session jobs: {err}")))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|err| BrokerError::Persistence(format!("list session jobs: {err}")))?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.find_job(&id)? {
                jobs.push(snapshot);
            }
        }
        Ok(jobs)
    }

    pub fn events_for_job(&self, job_id: &str) -> BrokerResult<Vec<StreamEvent>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "
                SELECT job_id, seq, chunk, stream, is_final, ts, exit_code
                FROM events
                WHERE job_id = ?1
                ORDER BY seq ASC
                ",
            )
            .map_err(|err| BrokerError::Persistence(format!("read events: {err}")))?;

        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i32>>(6)?,
                ))
            })
            .map_err(|err| BrokerError::Persistence(format!("read events: {err}")))?;

        let mut events = Vec::new();
        for row in rows {
            let (job_id, seq, chunk, stream, is_final, ts, exit_code) =
                row.map_err(|err| BrokerError::Persistence(format!("read events: {err}")))?;
            events.push(StreamEvent {
                job_id,
                seq,
                chunk,
                stream: parse_stream_kind(&stream)?,
                format: None,
                is_final,
                ts: parse_rfc3339(&ts)?,
                exit_code,
            });
        }
        Ok(events)
    }
}

impl SessionStore for SqliteStore {
    fn executor_session(
        &self,
        executor: &str,
        key: &SessionKey,
        workdir: &str,
    ) -> BrokerResult<String> {
        self.lock_conn()
            .query_row(
                "
                SELECT session_id FROM executor_sessions
                WHERE executor = ?1 AND platform = ?2 AND chat_id = ?3 AND thread_id = ?4 AND workdir = ?5
                ",
                params![
                    executor,
                    key.platform.as_str(),
                    key.chat_id,
                    key.thread_id,
                    workdir
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|session_id| session_id.unwrap_or_default())
            .map_err(|err| BrokerError::Persistence(format!("get executor session: {err}")))
    }

    fn upsert_executor_session(
        &self,
        executor: &str,
        key: &SessionKey,
        workdir: &str,
        session_id: &str,
    ) -> BrokerResult<()> {
        self.lock_conn()
            .execute(
                "
                INSERT INTO executor_sessions (executor, platform, chat_id, thread_id, workdir, session_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(executor, platform, chat_id, thread_id, workdir) DO UPDATE SET
                    session_id = excluded.session_id,
                    updated_at = excluded.updated_at
                ",
                params![
                    executor,
                    key.platform.as_str(),
                    key.chat_id,
                    key.thread_id,
                    workdir,
                    session_id,
                    to_rfc3339(OffsetDateTime::now_utc())?,
                ],
            )
            .map_err(|err| BrokerError::Persistence(format!("upsert executor session: {err}")))?;
        Ok(())
    }
}

fn to_rfc3339(timestamp: OffsetDateTime) -> BrokerResult<String> {
    timestamp
        .format(&Rfc3339)
        .map_err(|err| BrokerError::Persistence(format!("format timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> BrokerResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| BrokerError::Persistence(format!("parse timestamp '{value}': {err}")))
}

fn parse_job_status(value: &str) -> BrokerResult<JobStatus> {
    match value {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "done" => Ok(JobStatus::Done),
        "failed" => Ok(JobStatus::Failed),
        "stopped" => Ok(JobStatus::Stopped),
        other => Err(BrokerError::Persistence(format!(
            "unknown job status '{other}'"
        ))),
    }
}

fn parse_stream_kind(value: &str) -> BrokerResult<StreamKind> {
    match value {
        "stdout" => Ok(StreamKind::Stdout),
        "stderr" => Ok(StreamKind::Stderr),
        "meta" => Ok(StreamKind::Meta),
        other => Err(BrokerError::Persistence(format!(
            "unknown stream kind '{other}'"
        ))),
    }
}
