//! Request-level operations: upload, compress, status, download, cleanup.
//!
//! The [`Orchestrator`] validates request shapes, delegates to the
//! [`JobRegistry`] and the job state machine, and starts background
//! executions. It knows nothing about HTTP; the server maps its
//! [`sizeforge_core::Error`]s to responses.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use sizeforge_av::{BitrateParams, BitratePlan, Encoder, Prober};
use sizeforge_core::config::Config;
use sizeforge_core::{Error, JobId, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::jobs::{remove_file_if_exists, Executor, Job, JobRegistry, JobStatus};

/// Result of a successful upload.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UploadReceipt {
    #[schema(value_type = String)]
    pub job_id: JobId,
    pub filename: String,
    pub original_size: u64,
    /// Probed duration in seconds, when the container reports one.
    pub duration: Option<f64>,
}

/// Result of an accepted compress request.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CompressReceipt {
    pub accepted: bool,
    /// The job that is compressing. Differs from the requested id when a
    /// finished job was retried.
    #[schema(value_type = String)]
    pub job_id: JobId,
    /// The finished job this one retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub retry_of: Option<JobId>,
    pub target_size: u64,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
}

/// Point-in-time view of a job for status polling.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobStatusView {
    #[schema(value_type = String)]
    pub job_id: JobId,
    pub status: JobStatus,
    pub filename: String,
    /// Aggregate progress over both passes, in `[0, 1]`.
    pub progress: f64,
    /// Estimated seconds remaining while compressing.
    pub eta: Option<f64>,
    /// Current pass (1 or 2) while compressing.
    pub pass: Option<u8>,
    /// Encoding speed as a multiple of real time while compressing.
    pub speed: Option<f64>,
    /// Log lines from `log_offset` onwards.
    pub logs: Vec<String>,
    pub log_offset: usize,
    /// Total number of log lines; pass it back as `since` to get only new lines.
    pub log_count: usize,
    pub original_size: u64,
    pub target_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The job a retry of this one was registered as.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub retried_as: Option<JobId>,
}

impl JobStatusView {
    fn from_job(job: &Job, since: usize) -> Self {
        let logs = job.logs_since(since).to_vec();
        let log_count = job.logs.len();
        Self {
            job_id: job.id,
            status: job.status,
            filename: job.filename.clone(),
            progress: job.progress,
            eta: job.eta,
            pass: job.pass,
            speed: job.speed,
            log_offset: log_count - logs.len(),
            logs,
            log_count,
            original_size: job.original_size,
            target_size: job.target_size,
            output_size: job.output_size,
            error: job.error.clone(),
            retried_as: job.retried_as,
        }
    }
}

/// A finished output ready to be streamed to the client.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub path: PathBuf,
    /// Suggested name for the client's copy.
    pub filename: String,
    pub size: u64,
}

/// Result of a cleanup request.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CleanupReceipt {
    pub ok: bool,
    /// Whether the job was known before this request.
    pub existed: bool,
}

/// How a compress request proceeds once its parameters check out.
enum Start {
    InPlace(BitratePlan),
    /// A finished job handed its input to this fresh one, already started.
    Retry(Box<Job>, BitratePlan),
}

/// Entry point for every job operation.
///
/// Cheap to clone; all state lives behind `Arc`s.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<JobRegistry>,
    prober: Arc<dyn Prober>,
    executor: Executor,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, prober: Arc<dyn Prober>, encoder: Arc<dyn Encoder>) -> Self {
        let executor = Executor::new(encoder, config.jobs.max_concurrent_encodes);
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            prober,
            executor,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Create the upload, output and work directories.
    pub async fn prepare_dirs(&self) -> Result<()> {
        let storage = &self.config.storage;
        for dir in [&storage.upload_dir, &storage.output_dir, &storage.work_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Store an uploaded file and register a job for it.
    ///
    /// The body is streamed to disk and capped at `server.max_upload_bytes`.
    /// A file the prober cannot read is rejected and removed; a missing
    /// duration is only reported once compression is requested.
    pub async fn upload<S, E>(&self, filename: &str, body: S) -> Result<UploadReceipt>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let filename = sanitize_filename(filename)
            .ok_or_else(|| Error::Validation("a filename is required".into()))?;
        if !self.config.storage.accepts(&filename) {
            return Err(Error::Validation(format!(
                "unsupported file type: {filename}; allowed: {}",
                self.config.storage.allowed_extensions.join(", ")
            )));
        }

        let id = JobId::new();
        let input_path = self.config.storage.upload_dir.join(format!("{id}_{filename}"));
        let (output_path, work_dir) = self.output_paths(id, &filename);

        let original_size = match self.write_upload(&input_path, body).await {
            Ok(size) => size,
            Err(e) => {
                remove_file_if_exists(&input_path).await;
                return Err(e);
            }
        };

        let info = match self.prober.probe(&input_path).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(job_id = %id, "Rejecting unreadable upload {filename}: {e}");
                remove_file_if_exists(&input_path).await;
                return Err(Error::Validation(format!(
                    "{filename} is not a readable video: {e}"
                )));
            }
        };

        let mut job = Job::new(
            id,
            filename.clone(),
            input_path,
            output_path,
            work_dir,
            original_size,
            info.duration,
        )
        .with_audio(info.has_audio);
        match info.duration {
            Some(d) => job.log(format!("Probed {}: {d:.2} s", info.format)),
            None => job.log(format!("Probed {}: duration unknown", info.format)),
        }
        if !info.has_audio {
            job.log("No audio stream; encoding video only");
        }
        self.registry.insert(job);

        tracing::info!(job_id = %id, filename = %filename, original_size, "Upload stored");

        Ok(UploadReceipt {
            job_id: id,
            filename,
            original_size,
            duration: info.duration,
        })
    }

    /// Where job `id` writes its output and two-pass statistics.
    fn output_paths(&self, id: JobId, filename: &str) -> (PathBuf, PathBuf) {
        let storage = &self.config.storage;
        (
            storage
                .output_dir
                .join(format!("{id}_compressed_{}.mp4", file_stem(filename))),
            storage.work_dir.join(id.to_string()),
        )
    }

    async fn write_upload<S, E>(&self, path: &Path, body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let limit = self.config.server.max_upload_bytes;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;

        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| Error::Validation(format!("upload was interrupted: {e}")))?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(Error::Validation(format!(
                    "upload exceeds the {limit} byte limit"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(Error::Validation("the uploaded file is empty".into()));
        }
        Ok(written)
    }

    /// Start compressing a job towards `target_size` bytes.
    ///
    /// An uploaded job starts in place. A finished job is retried: a fresh
    /// job with a new id takes over its input and starts instead, and the
    /// receipt carries the new id. The old job keeps its state.
    ///
    /// The status check and the move to `compressing` happen under the job's
    /// write lock, so two concurrent requests can never both start it. When
    /// the bitrate cannot be computed an uploaded job moves straight to
    /// `error` and the cause is returned; no encoder is started.
    pub fn compress(&self, id: JobId, target_size: u64) -> Result<CompressReceipt> {
        if target_size == 0 {
            return Err(Error::Validation("target_size must be positive".into()));
        }

        let slot = self.registry.slot(id)?;
        let params = BitrateParams::from(&self.config.encoder);

        let start = slot.mutate(|job| -> Result<Start> {
            job.ensure_can_compress()?;
            if target_size >= job.original_size {
                return Err(Error::Validation(format!(
                    "target_size ({target_size} bytes) must be smaller than the original file ({} bytes)",
                    job.original_size
                )));
            }
            let params = if job.has_audio {
                params
            } else {
                params.without_audio()
            };
            let computed = BitratePlan::compute(target_size, job.duration, &params);

            if job.status.is_terminal() {
                let plan = computed?;
                // A slot being deleted may already have removed the input.
                if slot.is_closed() {
                    return Err(Error::not_found("job", id));
                }
                let next_id = JobId::new();
                let (output_path, work_dir) = self.output_paths(next_id, &job.filename);
                let mut next = job
                    .retry_as(next_id, output_path, work_dir)
                    .ok_or_else(|| Error::Conflict(format!("job {id} cannot be retried")))?;
                next.start(target_size, plan);
                return Ok(Start::Retry(Box::new(next), plan));
            }

            match computed {
                Ok(plan) => {
                    job.start(target_size, plan);
                    Ok(Start::InPlace(plan))
                }
                Err(e) => {
                    job.reject(target_size, e.to_string());
                    Err(e)
                }
            }
        });

        let (slot, plan, retry_of) = match start {
            Ok(Start::InPlace(plan)) => (slot, plan, None),
            Ok(Start::Retry(next, plan)) => {
                tracing::info!(job_id = %id, retry_id = %next.id, "Retrying finished job");
                (self.registry.insert(*next), plan, Some(id))
            }
            Err(e) => {
                if matches!(
                    e,
                    Error::TargetTooSmall { .. } | Error::DurationUnavailable(_)
                ) {
                    tracing::warn!(job_id = %id, error = %e, "Compression rejected");
                }
                return Err(e);
            }
        };

        slot.spawn_task(self.executor.clone().run(slot.clone()))?;

        tracing::info!(
            job_id = %slot.id(),
            target_size,
            video_bitrate = plan.video_bitrate_bps,
            audio_bitrate = plan.audio_bitrate_bps,
            "Compression started"
        );

        Ok(CompressReceipt {
            accepted: true,
            job_id: slot.id(),
            retry_of,
            target_size,
            video_bitrate: plan.video_bitrate_bps,
            audio_bitrate: plan.audio_bitrate_bps,
        })
    }

    /// Snapshot of a job with the log lines from `since` onwards.
    pub fn status(&self, id: JobId, since: usize) -> Result<JobStatusView> {
        let slot = self.registry.slot(id)?;
        Ok(slot.read(|job| JobStatusView::from_job(job, since)))
    }

    /// The finished output of a completed job.
    pub async fn download(&self, id: JobId) -> Result<DownloadTarget> {
        let job = self.registry.get(id)?;
        if job.status != JobStatus::Completed {
            return Err(Error::Conflict(format!(
                "job {id} is not completed (status: {})",
                job.status
            )));
        }

        let size = tokio::fs::metadata(&job.output_path)
            .await
            .map_err(|e| Error::Internal(format!("output file is missing: {e}")))?
            .len();

        Ok(DownloadTarget {
            path: job.output_path,
            filename: format!("compressed_{}.mp4", file_stem(&job.filename)),
            size,
        })
    }

    /// Cancel the job if it is running, then delete its files and forget it.
    /// Unknown ids succeed with `existed: false`.
    pub async fn cleanup(&self, id: JobId) -> CleanupReceipt {
        let existed = self.registry.delete(id).await;
        CleanupReceipt { ok: true, existed }
    }

    /// Clean up terminal jobs that finished more than `retention` ago.
    pub async fn sweep_expired(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - retention;
        let expired = self.registry.finished_before(cutoff);
        let mut removed = 0;
        for id in expired {
            if self.registry.delete(id).await {
                tracing::info!(job_id = %id, "Expired job cleaned up");
                removed += 1;
            }
        }
        removed
    }

    /// Periodically remove expired jobs until `cancel` fires. Returns at once
    /// when no retention is configured.
    pub async fn run_sweeper(self, cancel: CancellationToken) {
        let Some(retention_secs) = self.config.jobs.retention_secs else {
            return;
        };
        let retention = Duration::from_secs(retention_secs);
        let interval = Duration::from_secs(self.config.jobs.sweep_interval_secs.max(1));

        tracing::info!("Retention sweeper started (retention {retention_secs} s)");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            let removed = self.sweep_expired(retention).await;
            if removed > 0 {
                tracing::debug!("Sweeper removed {removed} expired jobs");
            }
        }

        tracing::info!("Retention sweeper stopped");
    }

    /// Cancel every running encode and wait for the encoders to exit.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Reduce a client-supplied filename to `[A-Za-z0-9._-]`, dropping any
/// directory part. Returns `None` when nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        None
    } else {
        Some(cleaned)
    }
}

fn file_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video")
}
