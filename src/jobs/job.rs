use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sizeforge_av::{BitratePlan, Pass, ProgressEvent};
use sizeforge_core::{Error, JobId, Result};
use std::path::PathBuf;

/// Lifecycle of a job: `uploaded -> compressing -> completed | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Uploaded,
    Compressing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Compressing => "compressing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upload-through-download unit of work.
///
/// All mutation goes through the transition methods below, which never move
/// a job backwards and never leave a terminal state. Progress only grows and
/// `logs` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Client-supplied filename after sanitizing.
    pub filename: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Holds the two-pass statistics files while compressing.
    pub work_dir: PathBuf,
    pub original_size: u64,
    pub duration: Option<f64>,
    /// Whether the probe found an audio stream. Silent inputs are encoded
    /// without one and give video the whole budget.
    pub has_audio: bool,
    pub status: JobStatus,
    pub target_size: Option<u64>,
    pub plan: Option<BitratePlan>,
    /// Current pass number while compressing.
    pub pass: Option<u8>,
    pub progress: f64,
    pub eta: Option<f64>,
    /// Encoding speed of the current pass as a multiple of real time.
    pub speed: Option<f64>,
    pub logs: Vec<String>,
    pub output_size: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Job that took over the input when this one was retried. Set at most
    /// once; from then on the input file belongs to that job.
    pub retried_as: Option<JobId>,
}

impl Job {
    pub fn new(
        id: JobId,
        filename: String,
        input_path: PathBuf,
        output_path: PathBuf,
        work_dir: PathBuf,
        original_size: u64,
        duration: Option<f64>,
    ) -> Self {
        let mut job = Self {
            id,
            filename,
            input_path,
            output_path,
            work_dir,
            original_size,
            duration,
            has_audio: true,
            status: JobStatus::Uploaded,
            target_size: None,
            plan: None,
            pass: None,
            progress: 0.0,
            eta: None,
            speed: None,
            logs: Vec::new(),
            output_size: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            retried_as: None,
        };
        job.log(format!(
            "Uploaded {} ({} bytes)",
            job.filename, job.original_size
        ));
        job
    }

    pub fn with_audio(mut self, has_audio: bool) -> Self {
        self.has_audio = has_audio;
        self
    }

    /// Whether deleting this job should delete its input file.
    pub fn owns_input(&self) -> bool {
        self.retried_as.is_none()
    }

    /// Append a line to the job log.
    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    /// Lines logged at or after `since`, clamped to the log length.
    pub fn logs_since(&self, since: usize) -> &[String] {
        &self.logs[since.min(self.logs.len())..]
    }

    /// Whether a compress request may act on this job right now.
    ///
    /// An uploaded job starts in place. A terminal job is retried through a
    /// fresh job, once; after that the retry owns the input.
    pub fn ensure_can_compress(&self) -> Result<()> {
        match (self.status, self.retried_as) {
            (JobStatus::Uploaded, _) => Ok(()),
            (JobStatus::Compressing, _) => Err(Error::Conflict(format!(
                "job {} is already compressing",
                self.id
            ))),
            (_, Some(next)) => Err(Error::Conflict(format!(
                "job {} was already retried as job {next}",
                self.id
            ))),
            (_, None) => Ok(()),
        }
    }

    /// Hand this terminal job's input over to a fresh job `id` that reuses
    /// the probed media facts. The successor starts out `uploaded`.
    ///
    /// Returns `None` unless the job is terminal and not yet retried.
    pub fn retry_as(&mut self, id: JobId, output_path: PathBuf, work_dir: PathBuf) -> Option<Job> {
        if !self.status.is_terminal() || self.retried_as.is_some() {
            return None;
        }
        self.retried_as = Some(id);
        self.log(format!("Retried as job {id}"));

        let mut next = Job::new(
            id,
            self.filename.clone(),
            self.input_path.clone(),
            output_path,
            work_dir,
            self.original_size,
            self.duration,
        )
        .with_audio(self.has_audio);
        next.log(format!("Retry of job {}", self.id));
        Some(next)
    }

    /// `uploaded -> compressing`.
    pub fn start(&mut self, target_size: u64, plan: BitratePlan) -> bool {
        if self.status != JobStatus::Uploaded {
            return false;
        }
        self.status = JobStatus::Compressing;
        self.target_size = Some(target_size);
        self.plan = Some(plan);
        self.progress = 0.0;
        self.eta = None;
        self.speed = None;
        self.started_at = Some(Utc::now());
        self.log(format!(
            "Compressing to {} bytes: video {} bps, audio {} bps",
            target_size, plan.video_bitrate_bps, plan.audio_bitrate_bps
        ));
        true
    }

    /// `uploaded -> error` when the encoding parameters cannot be computed.
    pub fn reject(&mut self, target_size: u64, message: impl Into<String>) -> bool {
        if self.status != JobStatus::Uploaded {
            return false;
        }
        self.target_size = Some(target_size);
        self.enter_error(message.into());
        true
    }

    /// Mark the start of a pass. Pass 2 begins at half progress even if the
    /// last pass 1 report fell short of 100%.
    pub fn enter_pass(&mut self, pass: Pass) {
        if self.status != JobStatus::Compressing {
            return;
        }
        self.pass = Some(pass.number());
        if pass == Pass::Encode {
            self.progress = self.progress.max(0.5);
        }
        self.log(format!("Pass {} ({}) started", pass.number(), pass.label()));
    }

    /// Fold one pass-relative progress event into the aggregate.
    ///
    /// Pass 1 covers `[0, 0.5]` and pass 2 `[0.5, 1]`. During pass 1 the ETA
    /// also counts pass 2, estimated to take as long as pass 1 will in total.
    pub fn record_progress(&mut self, pass: Pass, event: &ProgressEvent) {
        if self.status != JobStatus::Compressing {
            return;
        }

        let aggregate = match pass {
            Pass::Analysis => 0.5 * event.fraction,
            Pass::Encode => 0.5 + 0.5 * event.fraction,
        };
        self.progress = self.progress.max(aggregate.clamp(0.0, 1.0));

        self.eta = match (pass, event.eta_secs) {
            (Pass::Analysis, Some(remaining)) => {
                let pass_total = event.elapsed.as_secs_f64() / event.fraction;
                Some(remaining + pass_total)
            }
            (Pass::Encode, Some(remaining)) => Some(remaining),
            (_, None) => None,
        };
        if event.speed.is_some() {
            self.speed = event.speed;
        }
    }

    /// `compressing -> completed`.
    pub fn complete(&mut self, output_size: u64) -> bool {
        if self.status != JobStatus::Compressing {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 1.0;
        self.eta = None;
        self.speed = None;
        self.pass = None;
        self.output_size = Some(output_size);
        self.finished_at = Some(Utc::now());
        self.log(format!("Completed: {output_size} bytes"));
        true
    }

    /// `uploaded | compressing -> error`. Ignored once terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.enter_error(message.into());
        true
    }

    fn enter_error(&mut self, message: String) {
        self.status = JobStatus::Error;
        self.eta = None;
        self.speed = None;
        self.pass = None;
        self.finished_at = Some(Utc::now());
        self.log(format!("Error: {message}"));
        self.error = Some(message);
    }
}
