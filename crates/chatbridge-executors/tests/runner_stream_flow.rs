use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use chatbridge_executors::{EventSink, Executor, Runner};
use chatbridge_protocol::{
    BrokerError, BrokerResult, Job, JobStatus, PermissionMode, Platform, SessionKey, StreamEvent,
    StreamKind,
};

struct ShellExecutor {
    script: String,
    extra_success_code: Option<i32>,
}

impl ShellExecutor {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_owned(),
            extra_success_code: None,
        }
    }

    fn with_extra_success_code(mut self, code: i32) -> Self {
        self.extra_success_code = Some(code);
        self
    }
}

impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn build_command(&self, _job: &Job) -> BrokerResult<Vec<String>> {
        Ok(vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            self.script.clone(),
        ])
    }

    fn is_success_exit_code(&self, code: i32) -> bool {
        code == 0 || self.extra_success_code == Some(code)
    }
}

struct EmptyCommandExecutor;

impl Executor for EmptyCommandExecutor {
    fn name(&self) -> &'static str {
        "empty"
    }

    fn build_command(&self, _job: &Job) -> BrokerResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().expect("lock events").clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn on_event(&self, event: StreamEvent) -> BrokerResult<()> {
        self.events.lock().expect("lock events").push(event);
        Ok(())
    }
}

fn job() -> Job {
    Job {
        id: "00112233aabbccdd".to_owned(),
        session_key: SessionKey::new(Platform::Telegram, "1"),
        executor: "shell".to_owned(),
        session: String::new(),
        prompt: "ignored".to_owned(),
        workdir: std::env::temp_dir().to_string_lossy().into_owned(),
        permission_mode: PermissionMode::Sandbox,
        status: JobStatus::Pending,
        created_at: OffsetDateTime::now_utc(),
        started_at: None,
        finished_at: None,
        error_message: String::new(),
    }
}

fn assert_contiguous_with_single_final(events: &[StreamEvent]) {
    let mut seqs: Vec<i64> = events.iter().map(|event| event.seq).collect();
    seqs.sort_unstable();
    let expected: Vec<i64> = (1..=events.len() as i64).collect();
    assert_eq!(seqs, expected, "seq values must be contiguous from 1");

    let finals: Vec<&StreamEvent> = events.iter().filter(|event| event.is_final).collect();
    assert_eq!(finals.len(), 1, "exactly one terminal event");
    let max_seq = events.iter().map(|event| event.seq).max().expect("events");
    assert_eq!(finals[0].seq, max_seq, "terminal event carries the max seq");
    assert_eq!(finals[0].stream, StreamKind::Meta);
}

#[tokio::test]
async fn run_job_streams_lines_with_contiguous_seq_and_single_final_event() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_secs(10));
    let executor = ShellExecutor::new("printf 'a\\nb\\n'; printf 'warn\\n' >&2");

    runner
        .run_job(&executor, &job(), sink.clone(), CancellationToken::new())
        .await
        .expect("job succeeds");

    let events = sink.events();
    assert_eq!(events.len(), 4);
    assert_contiguous_with_single_final(&events);

    let stdout_chunks: Vec<&str> = events
        .iter()
        .filter(|event| event.stream == StreamKind::Stdout)
        .map(|event| event.chunk.as_str())
        .collect();
    assert_eq!(stdout_chunks, vec!["a\n", "b\n"]);

    let stderr_chunks: Vec<&str> = events
        .iter()
        .filter(|event| event.stream == StreamKind::Stderr)
        .map(|event| event.chunk.as_str())
        .collect();
    assert_eq!(stderr_chunks, vec!["warn\n"]);

    let final_event = events.iter().find(|event| event.is_final).expect("final");
    assert_eq!(final_event.exit_code, Some(0));
}

#[tokio::test]
async fn run_job_reports_the_real_exit_code_and_fails() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_secs(10));
    let executor = ShellExecutor::new("printf 'partial\\n'; exit 7");

    let error = runner
        .run_job(&executor, &job(), sink.clone(), CancellationToken::new())
        .await
        .expect_err("nonzero exit fails the job");
    assert!(error.to_string().contains("exit status 7"), "{error}");

    let events = sink.events();
    assert_contiguous_with_single_final(&events);
    let final_event = events.iter().find(|event| event.is_final).expect("final");
    assert_eq!(final_event.exit_code, Some(7));
    assert!(events
        .iter()
        .any(|event| !event.is_final && event.chunk == "partial\n"));
}

#[tokio::test]
async fn run_job_honors_the_adapter_exit_code_policy() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_secs(10));
    let executor = ShellExecutor::new("exit 7").with_extra_success_code(7);

    runner
        .run_job(&executor, &job(), sink.clone(), CancellationToken::new())
        .await
        .expect("policy treats 7 as success");

    let final_event = sink
        .events()
        .into_iter()
        .find(|event| event.is_final)
        .expect("final");
    assert_eq!(final_event.exit_code, Some(7));
}

#[tokio::test]
async fn run_job_cancellation_kills_the_child_and_still_emits_final_event() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_secs(60));
    let executor = ShellExecutor::new("sleep 30");
    let cancel = CancellationToken::new();

    let canceler = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceler.cancel();
    });

    let started = Instant::now();
    let error = runner
        .run_job(&executor, &job(), sink.clone(), cancel)
        .await
        .expect_err("cancellation fails the job");
    assert!(started.elapsed() < Duration::from_secs(10), "child was killed");
    assert!(matches!(error, BrokerError::Canceled(_)), "{error}");

    let events = sink.events();
    assert_contiguous_with_single_final(&events);
}

#[tokio::test]
async fn run_job_times_out_and_reports_cancellation() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_millis(200));
    let executor = ShellExecutor::new("sleep 30");

    let started = Instant::now();
    let error = runner
        .run_job(&executor, &job(), sink.clone(), CancellationToken::new())
        .await
        .expect_err("timeout fails the job");
    assert!(started.elapsed() < Duration::from_secs(10), "child was killed");
    assert!(error.to_string().contains("deadline exceeded"), "{error}");

    let events = sink.events();
    assert_contiguous_with_single_final(&events);
}

#[tokio::test]
async fn run_job_fails_when_a_line_exceeds_the_buffer_cap() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::new(Duration::from_secs(30));
    // 2 MiB on one line, no trailing newline needed to trip the cap.
    let executor = ShellExecutor::new("head -c 2097152 /dev/zero | tr '\\0' 'a'");

    let error = runner
        .run_job(&executor, &job(), sink.clone(), CancellationToken::new())
        .await
        .expect_err("oversized line fails the job");
    assert!(error.to_string().contains("exceeds"), "{error}");

    let events = sink.events();
    let finals: Vec<&StreamEvent> = events.iter().filter(|event| event.is_final).collect();
    assert_eq!(finals.len(), 1, "terminal event still emitted");
}

#[tokio::test]
async fn run_job_rejects_an_empty_argv() {
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::default();

    let error = runner
        .run_job(&EmptyCommandExecutor, &job(), sink, CancellationToken::new())
        .await
        .expect_err("empty argv is rejected");
    assert!(error.to_string().contains("empty command"), "{error}");
}
