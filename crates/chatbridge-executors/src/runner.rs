use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use chatbridge_protocol::{BrokerError, BrokerResult, Job, StreamEvent, StreamKind};

use crate::{EventSink, Executor};

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_LINE_BYTES: usize = 1024 * 1024;
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Spawns one executor child per job, pumps stdout/stderr into ordered
/// stream events, and emits exactly one synthetic terminal event carrying
/// the child's real exit code. Never retries.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    pub timeout: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Canceled,
}

impl Runner {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_JOB_TIMEOUT
        } else {
            timeout
        };
        Self { timeout }
    }

    pub async fn run_job(
        &self,
        executor: &dyn Executor,
        job: &Job,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> BrokerResult<()> {
        let args = executor.build_command(job)?;
        if args.is_empty() {
            return Err(BrokerError::Process(format!(
                "empty command for executor {}",
                executor.name()
            )));
        }

        let mut command = Command::new(&args[0]);
        command
            .args(&args[1..])
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| BrokerError::Process(format!("start command: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Process("child stdout unavailable".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrokerError::Process("child stderr unavailable".to_owned()))?;

        // One counter across both streams gives a total per-job order.
        let seq = Arc::new(AtomicI64::new(0));
        let stdout_task = tokio::spawn(pump_lines(
            stdout,
            StreamKind::Stdout,
            job.id.clone(),
            Arc::clone(&seq),
            Arc::clone(&sink),
        ));
        let stderr_task = tokio::spawn(pump_lines(
            stderr,
            StreamKind::Stderr,
            job.id.clone(),
            Arc::clone(&seq),
            Arc::clone(&sink),
        ));

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Canceled,
        };
        let (status, timed_out, canceled) = match outcome {
            WaitOutcome::Exited(status) => (status, false, false),
            WaitOutcome::TimedOut => (kill_and_reap(&mut child).await, true, false),
            WaitOutcome::Canceled => (kill_and_reap(&mut child).await, false, true),
        };

        let stdout_result = join_reader(stdout_task).await;
        let stderr_result = join_reader(stderr_task).await;

        let exit_code = match &status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let terminal_seq = seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = sink
            .on_event(StreamEvent::terminal(&job.id, terminal_seq, exit_code))
            .await
        {
            tracing::warn!(job_id = %job.id, error = %err, "terminal event sink failed");
        }

        if canceled {
            return Err(BrokerError::Canceled("context canceled".to_owned()));
        }
        if timed_out {
            return Err(BrokerError::Canceled(format!(
                "deadline exceeded after {:?}",
                self.timeout
            )));
        }
        if let Err(err) = status {
            return Err(BrokerError::Process(format!("wait for command: {err}")));
        }
        stdout_result?;
        stderr_result?;
        if !executor.is_success_exit_code(exit_code) {
            return Err(BrokerError::Process(format!(
                "command failed: exit status {exit_code}"
            )));
        }
        Ok(())
    }
}

async fn kill_and_reap(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    if let Err(err) = child.start_kill() {
        tracing::warn!(error = %err, "failed to signal executor child");
    }
    child.wait().await
}

async fn join_reader(
    task: tokio::task::JoinHandle<BrokerResult<()>>,
) -> BrokerResult<()> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(BrokerError::Process(format!("stream reader task: {err}"))),
    }
}

async fn pump_lines<R>(
    reader: R,
    stream: StreamKind,
    job_id: String,
    seq: Arc<AtomicI64>,
    sink: Arc<dyn EventSink>,
) -> BrokerResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, reader);
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        // Cap each line read so one runaway line cannot buffer unbounded.
        let mut limited = (&mut reader).take((MAX_LINE_BYTES + 1) as u64);
        let read = limited
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|err| {
                BrokerError::Process(format!("read {} stream: {err}", stream.as_str()))
            })?;
        if read == 0 {
            return Ok(());
        }
        let had_newline = buf.last() == Some(&b'\n');
        if had_newline {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > MAX_LINE_BYTES {
            return Err(BrokerError::Process(format!(
                "{} line exceeds {MAX_LINE_BYTES} bytes",
                stream.as_str()
            )));
        }

        let mut line = String::from_utf8_lossy(&buf).into_owned();
        line.push('\n');
        let next = seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = StreamEvent::line(&job_id, next, stream, line);
        if let Err(err) = sink.on_event(event).await {
            tracing::warn!(
                job_id = %job_id,
                stream = stream.as_str(),
                error = %err,
                "stream event sink failed"
            );
        }
    }
}
