use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use chatbridge_dispatch::{Dispatcher, JobWorker};
use chatbridge_executors::{EventSink, Executor, Runner};
use chatbridge_protocol::{
    BrokerResult, Job, JobStatus, Message, MessageHandler, OutboundMessage, PermissionMode,
    Platform, SessionKey, StreamEvent, Transport,
};
use chatbridge_security::{clean_path, Policy};
use chatbridge_store::SqliteStore;
use chatbridge_stream::Batcher;

use crate::session::{PendingInput, SessionManager};

const FALLBACK_EXECUTOR: &str = "codex";
const INBOUND_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_concurrent_sessions: usize,
    pub per_session_buffer: usize,
    pub batch_interval: Duration,
    pub max_chunk_bytes: usize,
}

/// Central controller: routes inbound chat messages to command handlers or
/// the job queue, and runs queued jobs through the executor runner with the
/// persist-then-deliver event sink.
pub struct Orchestrator {
    runtime: Arc<JobRuntime>,
    dispatcher: Dispatcher,
}

struct JobRuntime {
    store: Arc<SqliteStore>,
    sessions: Arc<SessionManager>,
    policy: Arc<Policy>,
    runner: Runner,
    executors: HashMap<String, Arc<dyn Executor>>,
    transports: HashMap<Platform, Arc<dyn Transport>>,
    active_jobs: Mutex<HashMap<String, CancellationToken>>,
    batch_interval: Duration,
    max_chunk_bytes: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        sessions: Arc<SessionManager>,
        policy: Arc<Policy>,
        runner: Runner,
        executors: HashMap<String, Arc<dyn Executor>>,
        transports: HashMap<Platform, Arc<dyn Transport>>,
        settings: OrchestratorSettings,
    ) -> Self {
        let runtime = Arc::new(JobRuntime {
            store,
            sessions,
            policy,
            runner,
            executors,
            transports,
            active_jobs: Mutex::new(HashMap::new()),
            batch_interval: settings.batch_interval,
            max_chunk_bytes: settings.max_chunk_bytes,
        });
        let dispatcher = Dispatcher::new(
            settings.max_concurrent_sessions,
            settings.per_session_buffer,
            Arc::clone(&runtime) as Arc<dyn JobWorker>,
        );
        Self {
            runtime,
            dispatcher,
        }
    }

    pub async fn handle_incoming_message(&self, message: Message) -> BrokerResult<()> {
        let text = message.text.trim().to_owned();
        if text.is_empty() {
            return Ok(());
        }
        let key = message.session_key.clone();
        tracing::info!(
            platform = key.platform.as_str(),
            chat_id = %key.chat_id,
            thread_id = %key.thread_id,
            sender_id = %message.sender_id,
            text = %shorten(&text, INBOUND_LOG_LIMIT),
            "message received"
        );

        if let Some(action) = self.runtime.sessions.take_pending_input(&key) {
            return match action {
                PendingInput::Cd => self.set_workdir(&key, &text).await,
                PendingInput::New => self.create_and_set_workdir(&key, &text).await,
            };
        }
        if text.starts_with('/') {
            return self.handle_command(&key, &text).await;
        }
        let executor = self.default_executor(&key);
        self.enqueue_job(&key, &executor, &text).await
    }

    async fn handle_command(&self, key: &SessionKey, text: &str) -> BrokerResult<()> {
        if text == "/new" {
            self.runtime
                .sessions
                .set_pending_input(key, PendingInput::New);
            return self.reply(key, "send project directory path for /new").await;
        }
        if let Some(path) = text.strip_prefix("/new ") {
            return self.create_and_set_workdir(key, path.trim()).await;
        }
        if text == "/cd" {
            let Some(root) = self.runtime.policy.primary_root() else {
                return self.reply(key, "project root is not configured").await;
            };
            let root = root.to_string_lossy().into_owned();
            return self.set_workdir(key, &root).await;
        }
        if let Some(path) = text.strip_prefix("/cd ") {
            return self.set_workdir(key, path.trim()).await;
        }
        if text == "/list" {
            return self.list_projects(key).await;
        }
        if text == "/codex" || text.starts_with("/codex ") {
            self.runtime.sessions.set_default_executor(key, "codex");
            if text == "/codex" {
                return self.reply(key, "default executor set to: codex").await;
            }
            let prompt = text["/codex ".len()..].trim();
            return self.enqueue_job(key, "codex", prompt).await;
        }
        if text == "/claude" || text.starts_with("/claude ") {
            self.runtime.sessions.set_default_executor(key, "claude");
            if text == "/claude" {
                return self.reply(key, "default executor set to: claude").await;
            }
            let prompt = text["/claude ".len()..].trim();
            return self.enqueue_job(key, "claude", prompt).await;
        }
        if text == "/reset" {
            self.runtime.sessions.reset(key);
            return self.reply(key, "session reset").await;
        }
        if text == "/status" {
            return self.report_status(key).await;
        }
        if text == "/mode" {
            let mode = self.runtime.sessions.permission_mode(key)?;
            return self.reply(key, &format!("mode: {mode}")).await;
        }
        if let Some(mode) = text.strip_prefix("/mode ") {
            let Some(mode) = PermissionMode::parse(mode) else {
                return self.reply(key, "usage: /mode <sandbox|full-access>").await;
            };
            self.runtime.sessions.set_permission_mode(key, mode)?;
            return self.reply(key, &format!("mode set to: {mode}")).await;
        }
        if let Some(job_id) = text.strip_prefix("/stop ") {
            let job_id = job_id.trim();
            let cancel = {
                let active = self
                    .runtime
                    .active_jobs
                    .lock()
                    .expect("active job map lock poisoned");
                active.get(job_id).cloned()
            };
            return match cancel {
                Some(cancel) => {
                    cancel.cancel();
                    self.reply(key, &format!("stop signal sent for job {job_id}"))
                        .await
                }
                None => self.reply(key, &format!("job not found: {job_id}")).await,
            };
        }
        self.reply(key, "unsupported command").await
    }

    async fn set_workdir(&self, key: &SessionKey, workdir: &str) -> BrokerResult<()> {
        let Some(target) = self.resolve_against_root(key, workdir).await? else {
            return Ok(());
        };
        let target = target.to_string_lossy().into_owned();
        if let Err(err) = self.runtime.policy.validate_workdir(&target) {
            return self.reply(key, &format!("workdir rejected: {err}")).await;
        }
        self.runtime.sessions.set_workdir(key, &target)?;
        self.reply(key, &format!("workdir set to: {target}")).await
    }

    async fn create_and_set_workdir(&self, key: &SessionKey, workdir: &str) -> BrokerResult<()> {
        if workdir.is_empty() {
            return self.reply(key, "workdir cannot be empty").await;
        }
        let Some(target) = self.resolve_against_root(key, workdir).await? else {
            return Ok(());
        };
        if let Err(err) = self
            .runtime
            .policy
            .validate_workdir(&target.to_string_lossy())
        {
            return self.reply(key, &format!("workdir rejected: {err}")).await;
        }
        if let Err(err) = std::fs::create_dir_all(&target) {
            return self
                .reply(key, &format!("create workdir failed: {err}"))
                .await;
        }
        let target = target.to_string_lossy().into_owned();
        self.runtime.sessions.set_workdir(key, &target)?;
        self.reply(key, &format!("workdir created and set: {target}"))
            .await
    }

    /// `None` means the failure reply was already sent.
    async fn resolve_against_root(
        &self,
        key: &SessionKey,
        workdir: &str,
    ) -> BrokerResult<Option<PathBuf>> {
        let path = Path::new(workdir);
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let Some(root) = self.runtime.policy.primary_root() else {
                self.reply(key, "project root is not configured").await?;
                return Ok(None);
            };
            root.join(path)
        };
        Ok(Some(clean_path(&target)))
    }

    async fn list_projects(&self, key: &SessionKey) -> BrokerResult<()> {
        let Some(root) = self.runtime.policy.primary_root() else {
            return self.reply(key, "project root is not configured").await;
        };
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                return self
                    .reply(key, &format!("list projects failed: {err}"))
                    .await;
            }
        };
        let mut projects: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        projects.sort();
        if projects.is_empty() {
            return self
                .reply(key, &format!("no projects found under {}", root.display()))
                .await;
        }
        self.reply(key, &format!("projects:\n- {}", projects.join("\n- ")))
            .await
    }

    async fn report_status(&self, key: &SessionKey) -> BrokerResult<()> {
        let workdir = self.runtime.sessions.workdir(key)?;
        let mode = self.runtime.sessions.permission_mode(key)?;
        let executor_name = self.default_executor(key);

        let mut session_id = "(unset)".to_owned();
        if !workdir.is_empty() {
            if let Some(layer) = self
                .runtime
                .executors
                .get(&executor_name)
                .and_then(|executor| executor.session_layer())
            {
                let probe = probe_job(key, &executor_name, &workdir);
                match layer.load_session(&probe) {
                    Err(_) => session_id = "(load failed)".to_owned(),
                    Ok(loaded) if !loaded.is_empty() => session_id = loaded,
                    Ok(_) => {}
                }
            }
        }
        let workdir_display = if workdir.is_empty() {
            "(unset)".to_owned()
        } else {
            workdir
        };
        self.reply(
            key,
            &format!(
                "Status:\nWorkdir: {workdir_display}\nExecutor: {executor_name}\nMode: {mode}\nExecutor session_id: {session_id}"
            ),
        )
        .await
    }

    async fn enqueue_job(&self, key: &SessionKey, executor_name: &str, prompt: &str) -> BrokerResult<()> {
        if prompt.is_empty() {
            return self.reply(key, "prompt cannot be empty").await;
        }
        let workdir = self.runtime.sessions.workdir(key)?;
        if workdir.is_empty() {
            return self
                .reply(key, "workdir is not set, use /cd <project_dir> first")
                .await;
        }
        let permission_mode = self.runtime.sessions.permission_mode(key)?;
        let mut job = Job {
            id: new_job_id(),
            session_key: key.clone(),
            executor: executor_name.to_owned(),
            session: String::new(),
            prompt: prompt.to_owned(),
            workdir,
            permission_mode,
            status: JobStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            finished_at: None,
            error_message: String::new(),
        };

        let Some(executor) = self.runtime.executors.get(executor_name) else {
            return self
                .reply(key, &format!("unknown executor: {executor_name}"))
                .await;
        };
        if let Some(layer) = executor.session_layer() {
            match layer.load_session(&job) {
                Ok(session_id) if !session_id.is_empty() => job.session = session_id,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(
                        executor = executor_name,
                        workdir = %job.workdir,
                        error = %err,
                        "load executor session failed"
                    );
                }
            }
        }
        if let Err(err) = self.runtime.policy.validate(&job) {
            return self.reply(key, &format!("job rejected: {err}")).await;
        }
        self.runtime.store.create_job(&job)?;
        let job_id = job.id.clone();
        self.dispatcher.enqueue(job).await;
        self.reply(key, &format!("job queued: {job_id}")).await
    }

    fn default_executor(&self, key: &SessionKey) -> String {
        self.runtime
            .sessions
            .default_executor(key)
            .unwrap_or_else(|| FALLBACK_EXECUTOR.to_owned())
    }

    async fn reply(&self, key: &SessionKey, text: &str) -> BrokerResult<()> {
        self.runtime.reply(key, text).await
    }

    /// Stops the dispatcher consumers and cancels every in-flight job.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        let active = self
            .runtime
            .active_jobs
            .lock()
            .expect("active job map lock poisoned");
        for cancel in active.values() {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, message: Message) -> BrokerResult<()> {
        self.handle_incoming_message(message).await
    }
}

impl JobRuntime {
    /// Chat delivery is best-effort: send failures are logged, never
    /// propagated.
    async fn reply(&self, key: &SessionKey, text: &str) -> BrokerResult<()> {
        let Some(transport) = self.transports.get(&key.platform) else {
            return Ok(());
        };
        if let Err(err) = transport
            .send(OutboundMessage::plain(key.clone(), text))
            .await
        {
            tracing::warn!(
                platform = key.platform.as_str(),
                error = %err,
                "reply delivery failed"
            );
        }
        Ok(())
    }

    async fn execute_job(&self, job: &Job, cancel: CancellationToken) {
        let Some(executor) = self.executors.get(&job.executor) else {
            let _ = self
                .reply(&job.session_key, &format!("unknown executor: {}", job.executor))
                .await;
            return;
        };
        let started = OffsetDateTime::now_utc();
        if let Err(err) =
            self.store
                .update_job_status(&job.id, JobStatus::Running, Some(started), None, "")
        {
            tracing::error!(job_id = %job.id, error = %err, "mark job running failed");
        }

        let Some(transport) = self.transports.get(&job.session_key.platform) else {
            let _ = self
                .reply(&job.session_key, "transport missing for platform")
                .await;
            return;
        };
        let batcher = Arc::new(Batcher::new(
            self.batch_interval,
            self.max_chunk_bytes,
            Arc::clone(transport),
            job.session_key.clone(),
        ));
        let sink = Arc::new(PersistSink {
            store: Arc::clone(&self.store),
            batcher: Arc::clone(&batcher),
            executor: Arc::clone(executor),
            captured_session: Mutex::new(String::new()),
        });

        let result = self
            .runner
            .run_job(executor.as_ref(), job, sink.clone(), cancel)
            .await;
        if let Err(err) = batcher.flush().await {
            tracing::debug!(job_id = %job.id, error = %err, "batcher flush failed");
        }

        if let Some(layer) = executor.session_layer() {
            let session_id = {
                let captured = sink
                    .captured_session
                    .lock()
                    .expect("captured session lock poisoned");
                captured.clone()
            };
            if !session_id.is_empty() {
                match layer.save_session(job, &session_id) {
                    Ok(()) => tracing::info!(
                        executor = %job.executor,
                        workdir = %job.workdir,
                        session_id = %session_id,
                        "executor session saved"
                    ),
                    Err(err) => tracing::error!(
                        executor = %job.executor,
                        workdir = %job.workdir,
                        error = %err,
                        "save executor session failed"
                    ),
                }
            }
        }

        let finished = OffsetDateTime::now_utc();
        match result {
            Ok(()) => {
                if let Err(err) = self.store.update_job_status(
                    &job.id,
                    JobStatus::Done,
                    Some(started),
                    Some(finished),
                    "",
                ) {
                    tracing::error!(job_id = %job.id, error = %err, "mark job done failed");
                }
                let _ = self
                    .reply(&job.session_key, &format!("job done: {}", job.id))
                    .await;
            }
            Err(err) => {
                if let Err(update_err) = self.store.update_job_status(
                    &job.id,
                    JobStatus::Failed,
                    Some(started),
                    Some(finished),
                    &err.to_string(),
                ) {
                    tracing::error!(job_id = %job.id, error = %update_err, "mark job failed failed");
                }
                let _ = self
                    .reply(&job.session_key, &format!("job failed: {err}"))
                    .await;
            }
        }
    }
}

#[async_trait]
impl JobWorker for JobRuntime {
    async fn run(&self, job: Job) {
        let cancel = CancellationToken::new();
        self.active_jobs
            .lock()
            .expect("active job map lock poisoned")
            .insert(job.id.clone(), cancel.clone());
        self.execute_job(&job, cancel).await;
        self.active_jobs
            .lock()
            .expect("active job map lock poisoned")
            .remove(&job.id);
    }
}

/// Applies the adapter rewrite, persists the event, then hands it to the
/// batcher. Persistence failures propagate; delivery failures do not.
struct PersistSink {
    store: Arc<SqliteStore>,
    batcher: Arc<Batcher>,
    executor: Arc<dyn Executor>,
    captured_session: Mutex<String>,
}

#[async_trait]
impl EventSink for PersistSink {
    async fn on_event(&self, mut event: StreamEvent) -> BrokerResult<()> {
        if let Some(layer) = self.executor.session_layer() {
            if let Some(session_id) = layer.handle_event(&mut event) {
                let mut captured = self
                    .captured_session
                    .lock()
                    .expect("captured session lock poisoned");
                *captured = session_id;
            }
        }
        self.store.append_event(&event)?;
        if let Err(err) = self.batcher.on_event(&event).await {
            tracing::debug!(job_id = %event.job_id, error = %err, "outbound chunk delivery failed");
        }
        Ok(())
    }
}

fn new_job_id() -> String {
    let mut bytes = [0_u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn probe_job(key: &SessionKey, executor: &str, workdir: &str) -> Job {
    Job {
        id: String::new(),
        session_key: key.clone(),
        executor: executor.to_owned(),
        session: String::new(),
        prompt: String::new(),
        workdir: workdir.to_owned(),
        permission_mode: PermissionMode::Sandbox,
        status: JobStatus::Pending,
        created_at: OffsetDateTime::now_utc(),
        started_at: None,
        finished_at: None,
        error_message: String::new(),
    }
}

fn shorten(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
