//! Concurrent store of every known job.
//!
//! Each entry is an [`Arc<JobSlot>`] so the background execution and any
//! number of status pollers can hold the same slot without keeping a map
//! shard locked. Readers only ever receive clones taken under the slot's
//! read lock, so a snapshot is never half-updated.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sizeforge_core::{Error, JobId, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job::Job;

/// A job plus the handles needed to stop its background execution.
pub struct JobSlot {
    id: JobId,
    job: RwLock<Job>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        Self {
            id: job.id,
            job: RwLock::new(job),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Consistent copy of the job.
    pub fn snapshot(&self) -> Job {
        self.job.read().clone()
    }

    /// Run `f` against the job under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        f(&self.job.read())
    }

    /// Run `f` against the job under the write lock. Everything `f` changes
    /// becomes visible to readers at once.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        f(&mut self.job.write())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the slot has been stopped for deletion or shutdown.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start the job's background execution.
    ///
    /// Fails once the slot has been cancelled (the job is being deleted) or
    /// while an earlier execution is still running.
    pub fn spawn_task<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task.lock();
        if self.cancel.is_cancelled() {
            return Err(Error::not_found("job", self.id));
        }
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(Error::Conflict(format!(
                "job {} already has a running execution",
                self.id
            )));
        }
        *task = Some(tokio::spawn(fut));
        Ok(())
    }

    /// Cancel the execution, if any, and wait for it to finish.
    async fn stop(&self) {
        self.cancel.cancel();
        // Taken under the same lock `spawn_task` holds, so no execution can
        // start after this point.
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(job_id = %self.id, "Job execution panicked: {e}");
                }
            }
        }
    }
}

/// Concurrent map of jobs keyed by [`JobId`].
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobSlot>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly uploaded job.
    pub fn insert(&self, job: Job) -> Arc<JobSlot> {
        let slot = Arc::new(JobSlot::new(job));
        self.jobs.insert(slot.id(), slot.clone());
        slot
    }

    pub fn slot(&self, id: JobId) -> Result<Arc<JobSlot>> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Snapshot of a job.
    pub fn get(&self, id: JobId) -> Result<Job> {
        Ok(self.slot(id)?.snapshot())
    }

    pub fn mutate<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Result<R> {
        Ok(self.slot(id)?.mutate(f))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let slots: Vec<Arc<JobSlot>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut jobs: Vec<Job> = slots.iter().map(|s| s.snapshot()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Terminal jobs that finished before `cutoff`.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let slots: Vec<Arc<JobSlot>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        slots
            .iter()
            .filter(|s| {
                s.read(|j| {
                    j.status.is_terminal() && j.finished_at.is_some_and(|at| at < cutoff)
                })
            })
            .map(|s| s.id())
            .collect()
    }

    /// Remove a job, stop its execution and delete its files.
    ///
    /// The encoder process has exited before any file is removed. An input
    /// handed to a retry is left for that job. Returns whether the job
    /// existed; deleting an unknown id is a no-op.
    pub async fn delete(&self, id: JobId) -> bool {
        let Some((_, slot)) = self.jobs.remove(&id) else {
            return false;
        };

        slot.stop().await;

        let (input, output, work_dir) = slot.read(|j| {
            (
                j.owns_input().then(|| j.input_path.clone()),
                j.output_path.clone(),
                j.work_dir.clone(),
            )
        });
        if let Some(input) = input {
            remove_file_if_exists(&input).await;
        }
        remove_file_if_exists(&output).await;
        remove_dir_if_exists(&work_dir).await;

        tracing::info!(job_id = %id, "Job deleted");
        true
    }

    /// Cancel every running execution and wait for all of them. Jobs and
    /// their files stay in place.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<JobSlot>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        for slot in &slots {
            slot.cancel.cancel();
        }
        for slot in &slots {
            slot.stop().await;
        }
    }
}

pub(crate) async fn remove_file_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}
