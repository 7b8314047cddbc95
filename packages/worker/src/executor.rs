//! Job execution: engine command synthesis, bounded run, exit
//! classification.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use ffrtmp_core::protocol::ReportedStatus;
use ffrtmp_core::{Engine, FailureReason, Job};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keep only the tail of captured output; encoder logs can be enormous.
const LOG_CAP_BYTES: usize = 64 * 1024;

/// stderr fragments that mark the input, not the machine, as the problem.
const USER_ERROR_PATTERNS: &[&str] = &[
    "Invalid argument",
    "Invalid data found",
    "No such file or directory",
    "Unrecognized option",
    "Option not found",
    "does not contain any stream",
];

/// What the executor hands back for reporting.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ReportedStatus,
    pub failure_reason: Option<FailureReason>,
    pub logs: String,
    pub metrics: HashMap<String, f64>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn failed(reason: FailureReason, logs: String, error: String, wall: Duration) -> Self {
        Self {
            status: ReportedStatus::Failed,
            failure_reason: Some(reason),
            logs,
            metrics: base_metrics(wall),
            error: Some(error),
        }
    }
}

fn base_metrics(wall: Duration) -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("wall_time_secs".to_string(), wall.as_secs_f64());
    m
}

/// Run one job to completion, cancellation or deadline.
///
/// The deadline comes from the job itself (`timeout_at`, stamped by the
/// master when the job entered `Running`); live jobs have none and are
/// bounded only by the cancellation token and the master's activity
/// timeout.
pub async fn execute(job: &Job, cancel: &CancellationToken) -> ExecutionOutcome {
    let started = Instant::now();

    let mut command = match synthesize_command(job) {
        Ok(c) => c,
        Err(e) => {
            return ExecutionOutcome::failed(
                FailureReason::UserError,
                String::new(),
                e,
                started.elapsed(),
            );
        }
    };

    debug!(job_id = %job.id, "spawning encoder process");
    let mut child = match command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // The engine vanished after capability validation; this node
            // cannot run what it advertised.
            return ExecutionOutcome::failed(
                FailureReason::CapabilityMismatch,
                String::new(),
                format!("engine binary not found: {e}"),
                started.elapsed(),
            );
        }
        Err(e) => {
            return ExecutionOutcome::failed(
                FailureReason::RuntimeError,
                String::new(),
                format!("failed to spawn encoder: {e}"),
                started.elapsed(),
            );
        }
    };

    let mut stderr = child.stderr.take();
    let log_reader = async {
        let mut buf = Vec::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    };

    let deadline = job
        .timeout_at
        .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(Duration::from_secs(24 * 60 * 60));

    enum Waited {
        Done(std::io::Result<std::process::ExitStatus>, Vec<u8>),
        Canceled,
        DeadlineExceeded,
    }

    let waited = tokio::select! {
        (result, buf) = async { tokio::join!(child.wait(), log_reader) } => {
            Waited::Done(result, buf)
        }
        _ = cancel.cancelled() => Waited::Canceled,
        _ = tokio::time::sleep(deadline) => Waited::DeadlineExceeded,
    };

    let (wait_result, log_buf) = match waited {
        Waited::Done(result, buf) => (result, buf),
        Waited::Canceled => {
            warn!(job_id = %job.id, "execution canceled, killing encoder");
            let _ = child.kill().await;
            return ExecutionOutcome {
                status: ReportedStatus::Canceled,
                failure_reason: None,
                logs: String::new(),
                metrics: base_metrics(started.elapsed()),
                error: Some("graceful shutdown".to_string()),
            };
        }
        Waited::DeadlineExceeded => {
            warn!(job_id = %job.id, "job deadline exceeded, killing encoder");
            let _ = child.kill().await;
            return ExecutionOutcome::failed(
                FailureReason::Timeout,
                String::new(),
                "job-wide deadline exceeded".to_string(),
                started.elapsed(),
            );
        }
    };

    let wall = started.elapsed();
    let logs = tail_utf8(&log_buf, LOG_CAP_BYTES);

    let status = match wait_result {
        Ok(status) => status,
        Err(e) => {
            return ExecutionOutcome::failed(
                FailureReason::RuntimeError,
                logs,
                format!("failed to reap encoder: {e}"),
                wall,
            );
        }
    };

    if status.success() {
        let mut metrics = base_metrics(wall);
        metrics.insert("exit_code".to_string(), 0.0);
        return ExecutionOutcome {
            status: ReportedStatus::Completed,
            failure_reason: None,
            logs,
            metrics,
            error: None,
        };
    }

    let (reason, error) = classify_failure(&status, &logs);
    let mut outcome = ExecutionOutcome::failed(reason, logs, error, wall);
    if let Some(code) = status.code() {
        outcome.metrics.insert("exit_code".to_string(), code as f64);
    }
    outcome
}

/// Exit classification: death by signal is the machine's fault and
/// retryable; a nonzero exit blaming the input is the submitter's fault
/// and final; everything else is a runtime error.
fn classify_failure(status: &std::process::ExitStatus, logs: &str) -> (FailureReason, String) {
    match status.code() {
        None => (
            FailureReason::RuntimeError,
            "encoder terminated by signal".to_string(),
        ),
        Some(code) => {
            if USER_ERROR_PATTERNS.iter().any(|p| logs.contains(p)) {
                (
                    FailureReason::UserError,
                    format!("encoder rejected input (exit code {code})"),
                )
            } else {
                (
                    FailureReason::RuntimeError,
                    format!("encoder failed with exit code {code}"),
                )
            }
        }
    }
}

/// Build the engine invocation from job parameters.
///
/// Recognized parameters: `input` (file/URL; a synthetic test source is
/// used when absent), `codec`, `bitrate`, `duration`, `output` (a null
/// sink when absent), `extra_args` (string list, passed through).
fn synthesize_command(job: &Job) -> Result<Command, String> {
    let engine = match job.engine {
        Engine::Ffmpeg | Engine::Auto => "ffmpeg",
        Engine::Gstreamer => "gst-launch-1.0",
    };
    if engine != "ffmpeg" {
        // GStreamer pipelines come in fully formed.
        let pipeline = param_str(job, "pipeline")
            .ok_or_else(|| "gstreamer jobs require a 'pipeline' parameter".to_string())?;
        let mut cmd = Command::new(engine);
        cmd.args(pipeline.split_whitespace());
        return Ok(cmd);
    }

    let mut cmd = Command::new(engine);
    cmd.args(["-hide_banner", "-y", "-nostdin"]);

    match param_str(job, "input") {
        Some(input) => {
            cmd.args(["-i", &input]);
        }
        None => {
            let duration = param_str(job, "duration").unwrap_or_else(|| "5".to_string());
            cmd.args([
                "-f",
                "lavfi",
                "-i",
                &format!("testsrc2=duration={duration}:size=1280x720:rate=30"),
            ]);
        }
    }

    if let Some(codec) = param_str(job, "codec") {
        cmd.args(["-c:v", &codec]);
    }
    if let Some(bitrate) = param_str(job, "bitrate") {
        cmd.args(["-b:v", &bitrate]);
    }
    if let Some(extra) = job.params.get("extra_args").and_then(|v| v.as_array()) {
        for arg in extra.iter().filter_map(|v| v.as_str()) {
            cmd.arg(arg);
        }
    }

    match param_str(job, "output") {
        Some(output) => {
            cmd.arg(&output);
        }
        None => {
            cmd.args(["-f", "null", "-"]);
        }
    }

    Ok(cmd)
}

fn param_str(job: &Job, key: &str) -> Option<String> {
    job.params.get(key).and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn tail_utf8(buf: &[u8], cap: usize) -> String {
    let start = buf.len().saturating_sub(cap);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}
