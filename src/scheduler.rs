//! Concurrent, retrying, resumable execution of a download job.
//!
//! A job aggregates one task per remote object. Tasks are owned by the
//! scheduler: each task value moves into its worker future and comes back
//! with its terminal state, so no task state is ever shared mutably across
//! workers. A bounded number of tasks run at once; the job settles only
//! after every dispatched task has reached a terminal state.
//!
//! Per task:
//! 1. If the destination already matches the listed size/ETag, the task
//!    completes without any transfer (idempotent resume).
//! 2. Otherwise the object streams into `<destination>.partial`. A partial
//!    file left by an earlier interrupted run is continued with a byte-range
//!    request. The temp file is verified, then renamed into place.
//! 3. Transient failures and integrity mismatches retry with exponential
//!    backoff up to the attempt bound, then mark the task failed.
//!
//! Cancellation is cooperative: it stops dispatch of new tasks, aborts
//! in-flight transfers, and discards their partial files. Completed files
//! are kept.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::store::{StorageObjectRef, StoreOps};
use crate::verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct DownloadTask {
    pub object: StorageObjectRef,
    pub destination: PathBuf,
    pub state: TaskState,
    pub attempts: u32,
    error: Option<String>,
    skipped: bool,
}

#[derive(Debug)]
pub struct DownloadJob {
    pub product_title: String,
    pub job_dir: PathBuf,
    pub tasks: Vec<DownloadTask>,
    pub state: JobState,
}

impl DownloadJob {
    /// Lay out one task per object under `{output_dir}/{product_title}/`,
    /// mirroring each key's path relative to the listed prefix. Keys that
    /// differ only below the prefix must never share a destination, so the
    /// relative path is kept whole. Keys with no path left after the
    /// prefix are ignored.
    pub fn new(
        product_title: &str,
        output_dir: &Path,
        prefix: &str,
        objects: Vec<StorageObjectRef>,
    ) -> Self {
        let job_dir = output_dir.join(product_title);
        let tasks = objects
            .into_iter()
            .filter_map(|object| {
                let relative = object
                    .key
                    .strip_prefix(prefix)
                    .unwrap_or(&object.key)
                    .trim_start_matches('/');
                if relative.is_empty() || relative.ends_with('/') {
                    return None;
                }
                let destination = job_dir.join(relative);
                Some(DownloadTask {
                    destination,
                    object,
                    state: TaskState::Pending,
                    attempts: 0,
                    error: None,
                    skipped: false,
                })
            })
            .collect();
        Self {
            product_title: product_title.to_string(),
            job_dir,
            tasks,
            state: JobState::Pending,
        }
    }

    fn settle(&mut self, cancelled: bool) {
        let all_completed = self
            .tasks
            .iter()
            .all(|t| t.state == TaskState::Completed);
        self.state = if all_completed {
            JobState::Succeeded
        } else if cancelled {
            JobState::Cancelled
        } else {
            JobState::Partial
        };
    }

    fn report(&self) -> JobReport {
        JobReport {
            product_title: self.product_title.clone(),
            state: self.state,
            completed: self
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .map(|t| t.object.key.clone())
                .collect(),
            skipped: self.tasks.iter().filter(|t| t.skipped).count(),
            failed: self
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Failed)
                .map(|t| FailedObject {
                    key: t.object.key.clone(),
                    attempts: t.attempts,
                    reason: t.error.clone().unwrap_or_default(),
                })
                .collect(),
            total: self.tasks.len(),
        }
    }
}

/// Per-object outcome of a settled job. Failures are itemized, never
/// silently dropped.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub product_title: String,
    pub state: JobState,
    pub completed: Vec<String>,
    /// Tasks completed without a transfer because the destination already
    /// matched.
    pub skipped: usize,
    pub failed: Vec<FailedObject>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedObject {
    pub key: String,
    pub attempts: u32,
    pub reason: String,
}

impl JobReport {
    pub fn summary(&self) -> String {
        format!(
            "{:?}, {}/{}",
            self.state,
            self.completed.len(),
            self.total
        )
        .to_lowercase()
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<(), FetchError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| FetchError::Config(format!("failed to serialize job report: {e}")))?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker-pool width.
    pub concurrency: usize,
    /// Backoff and attempt bound per task.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Error, Debug)]
enum AttemptError {
    #[error("{0}")]
    Transient(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("{0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

pub struct DownloadScheduler<'a, S> {
    store: &'a S,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl<'a, S: StoreOps> DownloadScheduler<'a, S> {
    pub fn new(store: &'a S, config: SchedulerConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    /// Run every task of `job` to a terminal state and settle the job.
    ///
    /// Returns `Err` only when the job cannot proceed at all (destination
    /// directory unwritable); the job is then marked `Failed`. All other
    /// outcomes, including per-object failures and cancellation, are
    /// reported through the `JobReport`.
    pub async fn run(&self, job: &mut DownloadJob) -> Result<JobReport, FetchError> {
        if let Err(e) = fs::create_dir_all(&job.job_dir) {
            job.state = JobState::Failed;
            return Err(FetchError::Io(e));
        }

        job.state = JobState::Running;
        info!(
            product = %job.product_title,
            tasks = job.tasks.len(),
            width = self.config.concurrency,
            "starting download job"
        );

        let tasks = std::mem::take(&mut job.tasks);
        job.tasks = stream::iter(tasks)
            .map(|task| self.run_task(task))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        // Keep the report ordering independent of completion order.
        job.tasks.sort_by(|a, b| a.object.key.cmp(&b.object.key));

        job.settle(self.cancel.is_cancelled());
        let report = job.report();
        info!(product = %job.product_title, outcome = %report.summary(), "job settled");
        Ok(report)
    }

    async fn run_task(&self, mut task: DownloadTask) -> DownloadTask {
        // Cancellation stops dispatch; undispatched tasks stay pending.
        if self.cancel.is_cancelled() {
            return task;
        }

        if verify::file_matches(
            &task.destination,
            task.object.size,
            task.object.etag.as_deref(),
        ) {
            debug!(key = %task.object.key, "destination already matches, skipping");
            task.state = TaskState::Completed;
            task.skipped = true;
            return task;
        }

        task.state = TaskState::InProgress;
        let mut delay = self.config.retry.initial_delay;

        loop {
            task.attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(AttemptError::Cancelled),
                result = self.attempt(&task.object, &task.destination) => result,
            };

            match outcome {
                Ok(()) => {
                    debug!(key = %task.object.key, attempts = task.attempts, "download complete");
                    task.state = TaskState::Completed;
                    break;
                }
                Err(AttemptError::Cancelled) => {
                    let _ = fs::remove_file(partial_path(&task.destination));
                    task.state = TaskState::Failed;
                    task.error = Some("cancelled".to_string());
                    break;
                }
                Err(AttemptError::Fatal(reason)) => {
                    warn!(key = %task.object.key, error = %reason, "download failed");
                    task.state = TaskState::Failed;
                    task.error = Some(reason);
                    break;
                }
                Err(err @ (AttemptError::Transient(_) | AttemptError::Integrity(_))) => {
                    let reason = err.to_string();
                    if task.attempts >= self.config.retry.max_attempts {
                        warn!(
                            key = %task.object.key,
                            attempts = task.attempts,
                            error = %reason,
                            "retries exhausted"
                        );
                        task.state = TaskState::Failed;
                        task.error = Some(reason);
                        break;
                    }
                    warn!(
                        key = %task.object.key,
                        attempt = task.attempts,
                        error = %reason,
                        "download attempt failed, backing off"
                    );
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        task.state = TaskState::Failed;
                        task.error = Some("cancelled".to_string());
                        break;
                    }
                    delay = self.config.retry.next_delay(delay);
                }
            }
        }

        task
    }

    /// One download attempt: stream into the partial file (continuing it
    /// when a previous run left usable bytes), verify, move into place.
    async fn attempt(
        &self,
        object: &StorageObjectRef,
        destination: &Path,
    ) -> Result<(), AttemptError> {
        let partial = partial_path(destination);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(fatal)?;
        }

        // A partial file larger than the object is stale; start over.
        if let Ok(meta) = fs::metadata(&partial) {
            if meta.len() > object.size {
                fs::remove_file(&partial).map_err(fatal)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&partial)
            .map_err(fatal)?;
        let mut written = file.metadata().map_err(fatal)?.len();

        if written > 0 && written < object.size {
            debug!(
                key = %object.key,
                resumed_at = written,
                total = object.size,
                "resuming partial download"
            );
        }

        if written < object.size {
            let response = if written == 0 {
                self.store.get_object(&object.bucket, &object.key).await
            } else {
                self.store
                    .get_object_range(&object.bucket, &object.key, written, object.size - 1)
                    .await
            }
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

            let mut body = response.body;
            while let Some(bytes) = body
                .try_next()
                .await
                .map_err(|e| AttemptError::Transient(e.to_string()))?
            {
                file.write_all(&bytes).map_err(fatal)?;
                written += bytes.len() as u64;
            }
        }
        drop(file);

        if let Err(e) = verify::verify_file(&partial, object.size, object.etag.as_deref()) {
            let _ = fs::remove_file(&partial);
            return Err(AttemptError::Integrity(e.to_string()));
        }

        fs::rename(&partial, destination).map_err(fatal)?;
        Ok(())
    }
}

fn fatal(e: std::io::Error) -> AttemptError {
    AttemptError::Fatal(e.to_string())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_owned();
    os.push(".partial");
    PathBuf::from(os)
}
