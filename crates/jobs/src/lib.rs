//! Background job manager
//!
//! Runs shell commands off the coordinator's critical path. Each job owns two
//! [`OutputBuffer`]s written by exactly one worker task and readable by any
//! number of callers. The registry is capped by count and by age; evicting a
//! running job cancels it first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_config::JobsConfig;

mod buffer;

pub use buffer::OutputBuffer;

/// How long pipe readers may keep draining after the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Job manager failures
#[derive(Error, Debug)]
pub enum JobError {
    #[error("◆ JOB NOT FOUND: {0}")]
    NotFound(String),

    #[error("◆ JOB NOT RUNNING: {0}")]
    NotRunning(String),

    #[error("◆ SPAWN FAILED: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_running(self) -> bool {
        self == JobStatus::Running
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundJob {
    pub id: String,
    pub command: String,
    pub description: Option<String>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Output of a job as returned by [`JobManager::get_output`]
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug)]
struct Completion {
    status: JobStatus,
    exit_code: Option<i32>,
    finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    id: String,
    seq: u64,
    command: String,
    description: Option<String>,
    started_at: DateTime<Utc>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    completion: Arc<Mutex<Completion>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl JobEntry {
    fn completion(&self) -> (JobStatus, Option<i32>, Option<DateTime<Utc>>) {
        let guard = match self.completion.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (guard.status, guard.exit_code, guard.finished_at)
    }

    fn status(&self) -> JobStatus {
        self.completion().0
    }

    fn snapshot(&self) -> BackgroundJob {
        let (status, exit_code, finished_at) = self.completion();
        BackgroundJob {
            id: self.id.clone(),
            command: self.command.clone(),
            description: self.description.clone(),
            status,
            exit_code,
            stdout: self.stdout.to_string_lossy(),
            stderr: self.stderr.to_string_lossy(),
            started_at: self.started_at,
            finished_at,
        }
    }
}

/// Process-wide registry of background jobs
pub struct JobManager {
    jobs: RwLock<HashMap<String, JobEntry>>,
    next_seq: AtomicU64,
    max_jobs: usize,
    retention: Duration,
    shell: String,
}

impl JobManager {
    pub fn new(config: &JobsConfig) -> Self {
        Self::with_limits(config.max_jobs, config.retention(), config.shell.clone())
    }

    pub fn with_limits(max_jobs: usize, retention: Duration, shell: impl Into<String>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_jobs: max_jobs.max(1),
            retention,
            shell: shell.into(),
        }
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, JobEntry>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Launch `command` through the configured shell and return its job id
    pub fn start(
        &self,
        command: &str,
        working_dir: Option<PathBuf>,
        description: Option<String>,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        // Room is made before the child exists, so the cap holds for live processes too
        let mut jobs = self.write_jobs();
        self.evict(&mut jobs);
        let mut child = cmd.spawn()?;

        let id = Uuid::new_v4().to_string()[..8].to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        let completion = Arc::new(Mutex::new(Completion {
            status: JobStatus::Running,
            exit_code: None,
            finished_at: None,
        }));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, stdout.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, stderr.clone())));

        {
            let id = id.clone();
            let completion = completion.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let (status, exit_code) = tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(job_id = %id, "◆ KILL FAILED: {}", e);
                        }
                        (JobStatus::Killed, None)
                    }
                    result = child.wait() => match result {
                        Ok(exit) if exit.success() => (JobStatus::Done, exit.code()),
                        Ok(exit) => (JobStatus::Failed, exit.code()),
                        Err(e) => {
                            warn!(job_id = %id, "◆ WAIT FAILED: {}", e);
                            (JobStatus::Failed, None)
                        }
                    }
                };

                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    let abort = task.abort_handle();
                    if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                        abort.abort();
                    }
                }

                {
                    let mut guard = match completion.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.status = status;
                    guard.exit_code = exit_code;
                    guard.finished_at = Some(Utc::now());
                }
                debug!(job_id = %id, %status, ?exit_code, "◆ JOB FINISHED");
                done_tx.send_replace(true);
            });
        }

        let entry = JobEntry {
            id: id.clone(),
            seq,
            command: command.to_string(),
            description,
            started_at: Utc::now(),
            stdout,
            stderr,
            completion,
            cancel,
            done: done_rx,
        };

        jobs.insert(id.clone(), entry);
        info!(job_id = %id, "◆ JOB STARTED: {}", command);
        Ok(id)
    }

    /// Drop expired jobs, then the oldest ones until there is room for one more
    fn evict(&self, jobs: &mut HashMap<String, JobEntry>) {
        let now = Utc::now();
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| {
                (now - job.started_at)
                    .to_std()
                    .map(|age| age >= self.retention)
                    .unwrap_or(false)
            })
            .map(|job| job.id.clone())
            .collect();
        for id in expired {
            if let Some(job) = jobs.remove(&id) {
                debug!(job_id = %id, "◆ JOB EXPIRED");
                job.cancel.cancel();
            }
        }

        while jobs.len() >= self.max_jobs {
            let oldest = jobs
                .values()
                .min_by_key(|job| (job.started_at, job.seq))
                .map(|job| job.id.clone());
            let Some(id) = oldest else { break };
            if let Some(job) = jobs.remove(&id) {
                if job.status().is_running() {
                    warn!(job_id = %id, "◆ EVICTING RUNNING JOB: {}", job.command);
                }
                job.cancel.cancel();
            }
        }
    }

    pub fn get_output(&self, id: &str) -> Result<JobOutput> {
        let jobs = self.read_jobs();
        let job = jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let (status, exit_code, _) = job.completion();
        Ok(JobOutput {
            stdout: job.stdout.to_string_lossy(),
            stderr: job.stderr.to_string_lossy(),
            status,
            exit_code,
        })
    }

    pub fn get(&self, id: &str) -> Option<BackgroundJob> {
        self.read_jobs().get(id).map(JobEntry::snapshot)
    }

    /// Request termination of a running job
    pub fn kill(&self, id: &str) -> Result<()> {
        let jobs = self.read_jobs();
        let job = jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !job.status().is_running() {
            return Err(JobError::NotRunning(id.to_string()));
        }
        info!(job_id = %id, "◆ KILLING JOB");
        job.cancel.cancel();
        Ok(())
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<BackgroundJob> {
        let jobs = self.read_jobs();
        let mut entries: Vec<&JobEntry> = jobs.values().collect();
        entries.sort_by_key(|job| (job.started_at, job.seq));
        entries.into_iter().map(JobEntry::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.read_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout` for the job to finish; returns its snapshot either way
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<BackgroundJob> {
        let mut done = {
            let jobs = self.read_jobs();
            jobs.get(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?
                .done
                .clone()
        };
        // A closed channel means the worker is gone; the snapshot below tells the rest.
        let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        self.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Forget a job, cancelling it first if it is still running
    pub fn remove(&self, id: &str) -> Result<BackgroundJob> {
        let job = self
            .write_jobs()
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if job.status().is_running() {
            job.cancel.cancel();
        }
        Ok(job.snapshot())
    }
}

async fn pump<R>(mut reader: R, buffer: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.append(&chunk[..n]),
            Err(e) => {
                debug!("◆ PIPE READ ENDED: {}", e);
                break;
            }
        }
    }
}
