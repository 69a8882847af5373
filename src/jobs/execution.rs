//! Background execution of a compressing job.
//!
//! Drives the job through pass 1 and pass 2 and commits every progress
//! tick, log line and the final transition through the job's slot. Every
//! failure ends up as a terminal `error` state; nothing here panics or
//! returns an error to the spawner.

use std::path::PathBuf;
use std::sync::Arc;

use sizeforge_av::{BitratePlan, Encoder, Pass, PassSpec, PassUpdate};
use sizeforge_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::registry::{remove_dir_if_exists, remove_file_if_exists, JobSlot};

/// File name prefix for ffmpeg's two-pass statistics inside the job's work
/// directory.
const PASSLOG_NAME: &str = "ffmpeg2pass";

/// Everything a job execution needs besides its slot.
#[derive(Clone)]
pub struct Executor {
    encoder: Arc<dyn Encoder>,
    /// Caps concurrent encodes; `None` means unlimited.
    limiter: Option<Arc<Semaphore>>,
}

struct Inputs {
    input: PathBuf,
    output: PathBuf,
    work_dir: PathBuf,
    plan: BitratePlan,
    duration: f64,
}

impl Executor {
    /// `max_concurrent` of 0 disables the cap.
    pub fn new(encoder: Arc<dyn Encoder>, max_concurrent: usize) -> Self {
        let limiter = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        Self { encoder, limiter }
    }

    /// Run a job that has just entered `compressing` to a terminal state.
    pub async fn run(self, slot: Arc<JobSlot>) {
        let job_id = slot.id();
        let cancel = slot.cancel_token();

        let inputs = slot.read(|j| {
            Some(Inputs {
                input: j.input_path.clone(),
                output: j.output_path.clone(),
                work_dir: j.work_dir.clone(),
                plan: j.plan?,
                duration: j.duration?,
            })
        });
        let Some(inputs) = inputs else {
            slot.mutate(|j| j.fail("job was started without encoding parameters"));
            return;
        };

        let result = self.execute(&slot, &inputs, &cancel).await;

        // Files are settled before the terminal state becomes visible.
        remove_dir_if_exists(&inputs.work_dir).await;
        if result.is_err() {
            remove_file_if_exists(&inputs.output).await;
        }

        match result {
            Ok(output_size) => {
                tracing::info!(job_id = %job_id, output_size, "Compression completed");
                slot.mutate(|j| j.complete(output_size));
            }
            Err(Error::Cancelled) => {
                tracing::info!(job_id = %job_id, "Compression cancelled");
                slot.mutate(|j| j.fail("compression was cancelled"));
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Compression failed");
                slot.mutate(|j| j.fail(e.to_string()));
            }
        }
    }

    async fn execute(
        &self,
        slot: &JobSlot,
        inputs: &Inputs,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let _permit = self.acquire(slot, cancel).await?;

        tokio::fs::create_dir_all(&inputs.work_dir).await?;
        let passlog_prefix = inputs.work_dir.join(PASSLOG_NAME);

        for pass in [Pass::Analysis, Pass::Encode] {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tracing::info!(job_id = %slot.id(), pass = pass.number(), "Starting pass");
            slot.mutate(|j| j.enter_pass(pass));

            let spec = PassSpec {
                pass,
                input: inputs.input.clone(),
                output: inputs.output.clone(),
                passlog_prefix: passlog_prefix.clone(),
                plan: inputs.plan,
                duration: inputs.duration,
            };

            let mut on_update = |update: PassUpdate| match update {
                PassUpdate::Progress(event) => slot.mutate(|j| j.record_progress(pass, &event)),
                PassUpdate::Log(line) => slot.mutate(|j| j.log(line)),
            };

            self.encoder
                .run_pass(&spec, &mut on_update, cancel.clone())
                .await?;

            slot.mutate(|j| j.log(format!("Pass {} finished", pass.number())));
        }

        let output_size = match tokio::fs::metadata(&inputs.output).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => return Err(Error::encode(2, "the encoder produced an empty file")),
            Err(e) => {
                return Err(Error::encode(
                    2,
                    format!("the encoder produced no output file: {e}"),
                ))
            }
        };

        Ok(output_size)
    }

    /// Wait for a concurrency permit, giving up as soon as the job is
    /// cancelled.
    async fn acquire(
        &self,
        slot: &JobSlot,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        if limiter.available_permits() == 0 {
            tracing::info!(job_id = %slot.id(), "Waiting for a free encoder slot");
            slot.mutate(|j| j.log("Waiting for a free encoder slot"));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = limiter.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|e| Error::Internal(format!("encoder limiter closed: {e}"))),
        }
    }
}
