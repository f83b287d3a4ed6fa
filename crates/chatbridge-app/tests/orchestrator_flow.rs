use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use chatbridge_app::{Orchestrator, OrchestratorSettings, SessionManager};
use chatbridge_executors::{Executor, Runner, SessionAware};
use chatbridge_protocol::{
    BrokerResult, Job, JobStatus, Message, MessageHandler, OutboundMessage, Platform, SessionKey,
    SessionStore, StreamEvent, StreamKind, Transport,
};
use chatbridge_security::Policy;
use chatbridge_store::SqliteStore;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl FakeTransport {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("lock sent")
            .iter()
            .map(|message| message.text.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(
        &self,
        _shutdown: CancellationToken,
        _handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<()> {
        Ok(())
    }

    async fn send(&self, outbound: OutboundMessage) -> BrokerResult<()> {
        self.sent.lock().expect("lock sent").push(outbound);
        Ok(())
    }
}

/// Stands in for the codex CLI: runs a shell script instead of the real
/// binary so jobs exercise the full runner path.
struct ScriptedExecutor {
    script: String,
}

impl ScriptedExecutor {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_owned(),
        }
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(&self, _job: &Job) -> BrokerResult<Vec<String>> {
        Ok(vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            self.script.clone(),
        ])
    }
}

/// Session-aware variant: lines starting with "SID " advertise a session
/// id, and the script sees the loaded session id through the `{session}`
/// placeholder in the argv.
struct SessionScriptedExecutor {
    script: String,
    sessions: Arc<dyn SessionStore>,
}

impl Executor for SessionScriptedExecutor {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(&self, job: &Job) -> BrokerResult<Vec<String>> {
        let script = self.script.replace("{session}", &job.session);
        Ok(vec!["/bin/sh".to_owned(), "-c".to_owned(), script])
    }

    fn session_layer(&self) -> Option<&dyn SessionAware> {
        Some(self)
    }
}

impl SessionAware for SessionScriptedExecutor {
    fn load_session(&self, job: &Job) -> BrokerResult<String> {
        self.sessions
            .executor_session(self.name(), &job.session_key, &job.workdir)
    }

    fn save_session(&self, job: &Job, session_id: &str) -> BrokerResult<()> {
        self.sessions
            .upsert_executor_session(self.name(), &job.session_key, &job.workdir, session_id)
    }

    fn handle_event(&self, event: &mut StreamEvent) -> Option<String> {
        if event.stream != StreamKind::Stdout {
            return None;
        }
        if let Some(session_id) = event.chunk.trim().strip_prefix("SID ") {
            let session_id = session_id.to_owned();
            event.chunk = String::new();
            return Some(session_id);
        }
        None
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    sessions: Arc<SessionManager>,
    transport: Arc<FakeTransport>,
    orchestrator: Orchestrator,
    root: PathBuf,
}

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!(
        "chatbridge-app-{prefix}-{nanos}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&path).expect("create temp dir");
    path
}

fn harness_with(
    prefix: &str,
    build: impl FnOnce(&Arc<SqliteStore>) -> Arc<dyn Executor>,
) -> Harness {
    harness_with_roots(prefix, true, build)
}

fn harness_with_roots(
    prefix: &str,
    with_roots: bool,
    build: impl FnOnce(&Arc<SqliteStore>) -> Arc<dyn Executor>,
) -> Harness {
    let root = unique_temp_dir(prefix);
    let store = Arc::new(SqliteStore::in_memory().expect("open store"));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Duration::from_secs(3600),
    ));
    let roots = if with_roots {
        vec![root.to_string_lossy().into_owned(), "/tmp".to_owned()]
    } else {
        Vec::new()
    };
    let policy = Arc::new(Policy::new(&["codex".to_owned()], &roots));
    let transport = Arc::new(FakeTransport::default());
    let mut transports: std::collections::HashMap<Platform, Arc<dyn Transport>> =
        std::collections::HashMap::new();
    transports.insert(Platform::Telegram, transport.clone());

    let mut executors: std::collections::HashMap<String, Arc<dyn Executor>> =
        std::collections::HashMap::new();
    executors.insert("codex".to_owned(), build(&store));

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
        policy,
        Runner::new(Duration::from_secs(10)),
        executors,
        transports,
        settings(),
    );
    Harness {
        store,
        sessions,
        transport,
        orchestrator,
        root,
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrent_sessions: 2,
        per_session_buffer: 8,
        batch_interval: Duration::from_millis(300),
        max_chunk_bytes: 3500,
    }
}

fn harness(prefix: &str, script: &str) -> Harness {
    let script = script.to_owned();
    harness_with(prefix, move |_| Arc::new(ScriptedExecutor::new(&script)))
}

fn key() -> SessionKey {
    SessionKey::new(Platform::Telegram, "1")
}

async fn send(harness: &Harness, text: &str) {
    harness
        .orchestrator
        .handle_incoming_message(Message {
            session_key: key(),
            sender_id: "u1".to_owned(),
            text: text.to_owned(),
            at: OffsetDateTime::now_utc(),
        })
        .await
        .expect("handle message");
}

async fn wait_for_reply_containing(harness: &Harness, needle: &str) -> String {
    timeout(WAIT_TIMEOUT, async {
        loop {
            if let Some(text) = harness
                .transport
                .texts()
                .into_iter()
                .find(|text| text.contains(needle))
            {
                return text;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for reply containing {needle:?}"))
}

fn extract_job_id(reply: &str) -> String {
    let id = reply
        .rsplit(' ')
        .next()
        .expect("job id in reply")
        .to_owned();
    assert_eq!(id.len(), 16, "job id should be 16 hex chars: {id}");
    assert!(id.chars().all(|ch| ch.is_ascii_hexdigit()));
    id
}

fn cleanup(harness: Harness) {
    harness.orchestrator.shutdown();
    let _ = std::fs::remove_dir_all(&harness.root);
}

#[tokio::test]
async fn setup_then_prompt_runs_a_job_end_to_end() {
    let harness = harness("setup-then-prompt", "echo ok");

    send(&harness, "/cd /tmp").await;
    send(&harness, "/codex").await;
    send(&harness, "hello").await;

    wait_for_reply_containing(&harness, "workdir set to: /tmp").await;
    wait_for_reply_containing(&harness, "default executor set to: codex").await;
    let queued = wait_for_reply_containing(&harness, "job queued: ").await;
    let job_id = extract_job_id(&queued);
    wait_for_reply_containing(&harness, &format!("job done: {job_id}")).await;

    let replies = harness.transport.texts();
    let index_of = |needle: &str| {
        replies
            .iter()
            .position(|text| text.contains(needle))
            .unwrap_or_else(|| panic!("missing reply {needle:?}"))
    };
    assert!(index_of("workdir set to: /tmp") < index_of("default executor set to: codex"));
    assert!(index_of("default executor set to: codex") < index_of("job queued: "));
    assert!(index_of("job queued: ") < index_of("job done: "));

    let snapshot = harness
        .store
        .find_job(&job_id)
        .expect("find job")
        .expect("job row exists");
    assert_eq!(snapshot.status, JobStatus::Done);
    assert_eq!(snapshot.workdir, "/tmp");
    cleanup(harness);
}

#[tokio::test]
async fn plain_message_without_workdir_asks_for_setup() {
    let harness = harness("needs-setup", "echo ok");
    send(&harness, "hello").await;
    wait_for_reply_containing(&harness, "workdir is not set, use /cd <project_dir> first").await;
    cleanup(harness);
}

#[tokio::test]
async fn new_with_absolute_path_creates_and_sets_workdir() {
    let harness = harness("new-absolute", "echo ok");
    let target = harness.root.join("project-a");

    send(&harness, &format!("/new {}", target.display())).await;
    wait_for_reply_containing(&harness, "workdir created and set: ").await;

    assert!(target.is_dir(), "target directory should exist");
    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        target.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn new_without_argument_consumes_the_next_message_as_path() {
    let harness = harness("new-pending", "echo ok");
    let target = harness.root.join("project-b");

    send(&harness, "/new").await;
    wait_for_reply_containing(&harness, "send project directory path for /new").await;
    send(&harness, &target.to_string_lossy()).await;
    wait_for_reply_containing(&harness, "workdir created and set: ").await;

    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        target.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn new_with_relative_path_creates_under_the_project_root() {
    let harness = harness("new-relative", "echo ok");

    send(&harness, "/new my-project").await;
    wait_for_reply_containing(&harness, "workdir created and set: ").await;

    let target = harness.root.join("my-project");
    assert!(target.is_dir(), "relative path resolves under the root");
    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        target.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn cd_without_path_uses_the_primary_root() {
    let harness = harness("cd-root", "echo ok");
    send(&harness, "/cd").await;
    wait_for_reply_containing(&harness, "workdir set to: ").await;
    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        harness.root.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn cd_without_configured_roots_reports_a_configuration_problem() {
    let harness = harness_with_roots("cd-no-roots", false, |_| {
        Arc::new(ScriptedExecutor::new("echo ok"))
    });
    send(&harness, "/cd").await;
    wait_for_reply_containing(&harness, "project root is not configured").await;

    send(&harness, "/cd relative-path").await;
    timeout(WAIT_TIMEOUT, async {
        loop {
            let texts = harness.transport.texts();
            if texts
                .iter()
                .filter(|text| text.contains("project root is not configured"))
                .count()
                >= 2
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relative /cd also needs a configured root");
    cleanup(harness);
}

#[tokio::test]
async fn cd_with_relative_path_resolves_against_the_primary_root() {
    let harness = harness("cd-relative", "echo ok");
    let target = harness.root.join("web");
    std::fs::create_dir_all(&target).expect("create web dir");

    send(&harness, "/cd web").await;
    wait_for_reply_containing(&harness, "workdir set to: ").await;
    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        target.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn cd_outside_the_roots_is_rejected() {
    let harness = harness("cd-rejected", "echo ok");
    send(&harness, "/cd /etc").await;
    let reply = wait_for_reply_containing(&harness, "workdir rejected: ").await;
    assert!(reply.contains("outside"), "{reply}");
    assert_eq!(harness.sessions.workdir(&key()).expect("workdir"), "");
    cleanup(harness);
}

#[tokio::test]
async fn list_shows_sorted_directories_and_skips_files_and_dotfiles() {
    let harness = harness("list", "echo ok");
    std::fs::create_dir(harness.root.join("b")).expect("mkdir b");
    std::fs::create_dir(harness.root.join("a")).expect("mkdir a");
    std::fs::create_dir(harness.root.join(".hidden")).expect("mkdir .hidden");
    std::fs::write(harness.root.join("readme.txt"), "x").expect("write file");

    send(&harness, "/list").await;
    let reply = wait_for_reply_containing(&harness, "projects:").await;
    let a_index = reply.find("- a").expect("lists a");
    let b_index = reply.find("- b").expect("lists b");
    assert!(a_index < b_index, "projects are sorted");
    assert!(!reply.contains("readme"));
    assert!(!reply.contains(".hidden"));
    cleanup(harness);
}

#[tokio::test]
async fn plain_prompt_uses_codex_as_the_default_executor() {
    let harness = harness("default-executor", "echo ok");
    send(&harness, "/cd").await;
    send(&harness, "hello").await;
    wait_for_reply_containing(&harness, "job queued: ").await;
    cleanup(harness);
}

#[tokio::test]
async fn policy_rejection_creates_no_job_row() {
    let harness = harness("policy-reject", "echo ok");
    // Seed a workdir the policy no longer admits; enqueue must reject it
    // before persisting anything.
    harness
        .sessions
        .set_workdir(&key(), "/etc")
        .expect("seed workdir");

    send(&harness, "hello").await;
    let reply = wait_for_reply_containing(&harness, "job rejected: ").await;
    assert!(reply.contains("workdir"), "{reply}");
    assert!(reply.contains("outside"), "{reply}");

    let jobs = harness.store.session_jobs(&key()).expect("list jobs");
    assert!(jobs.is_empty(), "no job row should exist: {jobs:?}");
    cleanup(harness);
}

#[tokio::test]
async fn unknown_executor_name_is_reported() {
    let harness = harness("unknown-executor", "echo ok");
    send(&harness, "/cd").await;
    send(&harness, "/claude hi").await;
    wait_for_reply_containing(&harness, "unknown executor: claude").await;
    cleanup(harness);
}

#[tokio::test]
async fn jobs_in_one_session_serialize_in_store_timestamps() {
    let harness = harness("serialize", "sleep 0.1; echo ok");
    send(&harness, "/cd").await;
    send(&harness, "first prompt").await;
    let first_queued = wait_for_reply_containing(&harness, "job queued: ").await;
    let first_id = extract_job_id(&first_queued);
    send(&harness, "second prompt").await;

    wait_for_reply_containing(&harness, &format!("job done: {first_id}")).await;
    let second_id = {
        let jobs = harness.store.session_jobs(&key()).expect("list jobs");
        assert_eq!(jobs.len(), 2);
        jobs.iter()
            .map(|job| job.id.clone())
            .find(|id| *id != first_id)
            .expect("second job id")
    };
    wait_for_reply_containing(&harness, &format!("job done: {second_id}")).await;

    let first = harness
        .store
        .find_job(&first_id)
        .expect("find first")
        .expect("first exists");
    let second = harness
        .store
        .find_job(&second_id)
        .expect("find second")
        .expect("second exists");
    let first_started = first.started_at.expect("first started");
    let first_finished = first.finished_at.expect("first finished");
    let second_started = second.started_at.expect("second started");
    assert!(first_started <= second_started);
    assert!(first_finished <= second_started);
    cleanup(harness);
}

#[tokio::test]
async fn mode_command_reads_and_updates_the_permission_mode() {
    let harness = harness("mode", "echo ok");
    send(&harness, "/mode").await;
    wait_for_reply_containing(&harness, "mode: sandbox").await;

    send(&harness, "/mode full-access").await;
    wait_for_reply_containing(&harness, "mode set to: full-access").await;

    send(&harness, "/mode root").await;
    wait_for_reply_containing(&harness, "usage: /mode <sandbox|full-access>").await;

    assert_eq!(
        harness
            .sessions
            .permission_mode(&key())
            .expect("mode")
            .as_str(),
        "full-access"
    );
    cleanup(harness);
}

#[tokio::test]
async fn status_reports_workdir_executor_mode_and_session_id() {
    let harness = harness("status", "echo ok");
    send(&harness, "/status").await;
    let reply = wait_for_reply_containing(&harness, "Status:").await;
    assert!(reply.contains("Workdir: (unset)"), "{reply}");
    assert!(reply.contains("Executor: codex"), "{reply}");
    assert!(reply.contains("Mode: sandbox"), "{reply}");
    assert!(reply.contains("Executor session_id: (unset)"), "{reply}");
    cleanup(harness);
}

#[tokio::test]
async fn stop_with_unknown_job_id_reports_not_found() {
    let harness = harness("stop-unknown", "echo ok");
    send(&harness, "/stop deadbeefdeadbeef").await;
    wait_for_reply_containing(&harness, "job not found: deadbeefdeadbeef").await;
    cleanup(harness);
}

#[tokio::test]
async fn stop_cancels_a_running_job_and_marks_it_failed() {
    let harness = harness("stop-running", "sleep 30");
    send(&harness, "/cd").await;
    send(&harness, "long prompt").await;
    let queued = wait_for_reply_containing(&harness, "job queued: ").await;
    let job_id = extract_job_id(&queued);

    // Let the worker pick the job up before stopping it.
    sleep(Duration::from_millis(100)).await;
    send(&harness, &format!("/stop {job_id}")).await;
    wait_for_reply_containing(&harness, &format!("stop signal sent for job {job_id}")).await;
    wait_for_reply_containing(&harness, "job failed: ").await;

    let snapshot = harness
        .store
        .find_job(&job_id)
        .expect("find job")
        .expect("job exists");
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert!(snapshot.error_message.contains("canceled"));
    cleanup(harness);
}

#[tokio::test]
async fn unsupported_commands_get_a_generic_reply() {
    let harness = harness("unsupported", "echo ok");
    send(&harness, "/frobnicate").await;
    wait_for_reply_containing(&harness, "unsupported command").await;
    cleanup(harness);
}

#[tokio::test]
async fn blank_messages_are_ignored() {
    let harness = harness("blank", "echo ok");
    send(&harness, "   ").await;
    sleep(Duration::from_millis(50)).await;
    assert!(harness.transport.texts().is_empty());
    cleanup(harness);
}

#[tokio::test]
async fn reset_clears_the_cached_session_state() {
    let harness = harness("reset", "echo ok");
    send(&harness, "/cd").await;
    wait_for_reply_containing(&harness, "workdir set to: ").await;
    send(&harness, "/reset").await;
    wait_for_reply_containing(&harness, "session reset").await;
    // The durable row remains, so the workdir comes back from the store.
    assert_eq!(
        harness.sessions.workdir(&key()).expect("workdir"),
        harness.root.to_string_lossy()
    );
    cleanup(harness);
}

#[tokio::test]
async fn captured_session_id_is_persisted_and_resumed_on_the_next_job() {
    let harness = harness_with("session-resume", |store| {
        Arc::new(SessionScriptedExecutor {
            script: "echo 'SID sid-123'; echo 'resume={session}'".to_owned(),
            sessions: Arc::clone(store) as Arc<dyn SessionStore>,
        })
    });

    send(&harness, "/cd").await;
    send(&harness, "first prompt").await;
    let queued = wait_for_reply_containing(&harness, "job queued: ").await;
    let first_id = extract_job_id(&queued);
    wait_for_reply_containing(&harness, &format!("job done: {first_id}")).await;

    let workdir = harness.sessions.workdir(&key()).expect("workdir");
    assert_eq!(
        harness
            .store
            .executor_session("codex", &key(), &workdir)
            .expect("load session"),
        "sid-123"
    );

    send(&harness, "second prompt").await;
    wait_for_reply_containing(&harness, "resume=sid-123").await;
    cleanup(harness);
}
