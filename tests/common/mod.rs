//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which wires an [`Orchestrator`] over temporary
//! directories with a scripted prober and encoder. The [`TestHarness::with_server`]
//! constructor starts Axum on a random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sizeforge::config::Config;
use sizeforge::orchestrator::{JobStatusView, Orchestrator, UploadReceipt};
use sizeforge::server::{create_router, AppContext};
use sizeforge_av::{Encoder, MediaInfo, Pass, PassSpec, PassUpdate, Prober, ProgressEvent};
use sizeforge_core::{Error, JobId, Result};

/// Prober that reports a fixed duration, or fails like ffprobe on garbage.
pub struct FakeProber {
    pub duration: Option<f64>,
    pub has_audio: bool,
    pub fail: bool,
}

#[async_trait]
impl Prober for FakeProber {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        if self.fail {
            return Err(Error::Probe("Invalid data found when processing input".into()));
        }
        let size = tokio::fs::metadata(path).await?.len();
        Ok(MediaInfo {
            duration: self.duration,
            size,
            format: "mov,mp4,m4a,3gp,3g2,mj2".into(),
            has_audio: self.has_audio,
        })
    }
}

/// Encoder standing in for ffmpeg.
///
/// Each pass reports four progress ticks `tick` apart and logs one
/// diagnostic line. Pass 2 writes an output whose size follows from the
/// planned bitrates, the way a well-behaved encoder lands on its target.
pub struct ScriptedEncoder {
    pub tick: Duration,
    /// Pass that exits with a failure after logging a diagnostic.
    pub fail_pass: Option<u8>,
    /// Sit in pass 1 until the job is cancelled.
    pub hold: bool,
    /// Reported on every progress tick.
    pub speed: f64,
    /// Audio bitrate of the last pass started, for checking silent plans.
    pub last_audio_bitrate: AtomicUsize,
    pub passes_run: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl Default for ScriptedEncoder {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            fail_pass: None,
            hold: false,
            speed: 2.5,
            last_audio_bitrate: AtomicUsize::new(usize::MAX),
            passes_run: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }
}

impl ScriptedEncoder {
    pub fn passes_run(&self) -> usize {
        self.passes_run.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn last_audio_bitrate(&self) -> usize {
        self.last_audio_bitrate.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn run_pass(
        &self,
        spec: &PassSpec,
        on_update: &mut (dyn FnMut(PassUpdate) + Send),
        cancel: CancellationToken,
    ) -> Result<()> {
        self.passes_run.fetch_add(1, Ordering::SeqCst);
        self.last_audio_bitrate
            .store(spec.plan.audio_bitrate_bps as usize, Ordering::SeqCst);
        let started = tokio::time::Instant::now();

        if self.hold {
            on_update(PassUpdate::Log("frame=    1 fps=0.0 q=0.0 size=N/A".into()));
            cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Cancelled);
        }

        for step in 1..=4 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            let fraction = step as f64 / 4.0;
            let elapsed = started.elapsed();
            on_update(PassUpdate::Progress(ProgressEvent {
                fraction,
                encoded_secs: fraction * spec.duration,
                elapsed,
                eta_secs: Some(elapsed.as_secs_f64() * (1.0 - fraction) / fraction),
                speed: Some(self.speed),
            }));
        }

        if self.fail_pass == Some(spec.pass.number()) {
            on_update(PassUpdate::Log(
                "[libx264 @ 0x55d5c] ratecontrol_init: can't open stats file".into(),
            ));
            return Err(Error::encode(spec.pass.number(), "ffmpeg exited with exit status: 1"));
        }

        on_update(PassUpdate::Log(format!(
            "video:{}kB audio:0kB subtitle:0kB other streams:0kB",
            spec.plan.video_bitrate_bps / 8000
        )));

        if spec.pass == Pass::Encode {
            let total_bps = spec.plan.video_bitrate_bps + spec.plan.audio_bitrate_bps;
            let size = (total_bps as f64 * spec.duration / 8.0) as usize;
            tokio::fs::write(&spec.output, vec![0u8; size]).await?;
        }

        Ok(())
    }
}

/// Knobs for building a [`TestHarness`].
pub struct HarnessOptions {
    pub duration: Option<f64>,
    pub has_audio: bool,
    pub probe_fails: bool,
    pub encoder: ScriptedEncoder,
    pub max_concurrent_encodes: usize,
    pub max_upload_bytes: u64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            duration: Some(10.0),
            has_audio: true,
            probe_fails: false,
            encoder: ScriptedEncoder::default(),
            max_concurrent_encodes: 2,
            max_upload_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Test harness wrapping an [`Orchestrator`] whose storage lives in a
/// temporary directory.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub encoder: Arc<ScriptedEncoder>,
    pub dir: TempDir,
}

impl TestHarness {
    /// Create a new harness with a 10 second input and a well-behaved encoder.
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");

        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        config.storage.output_dir = dir.path().join("outputs");
        config.storage.work_dir = dir.path().join("work");
        config.server.max_upload_bytes = options.max_upload_bytes;
        config.jobs.max_concurrent_encodes = options.max_concurrent_encodes;

        let encoder = Arc::new(options.encoder);
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            Arc::new(FakeProber {
                duration: options.duration,
                has_audio: options.has_audio,
                fail: options.probe_fails,
            }),
            encoder.clone(),
        );
        orchestrator
            .prepare_dirs()
            .await
            .expect("failed to create storage dirs");

        Self {
            orchestrator,
            encoder,
            dir,
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_options(HarnessOptions::default()).await
    }

    /// Start an Axum server with custom options on a random port.
    pub async fn with_server_options(options: HarnessOptions) -> (Self, SocketAddr) {
        let harness = Self::with_options(options).await;
        let ctx = AppContext {
            orchestrator: harness.orchestrator.clone(),
            tools: Arc::new(Vec::new()),
        };
        let app = create_router(ctx, None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }

    /// Upload `size` bytes of filler under `filename`.
    pub async fn upload(&self, filename: &str, size: usize) -> Result<UploadReceipt> {
        let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![
                7u8;
                size
            ]))]);
        self.orchestrator.upload(filename, body).await
    }

    /// Poll until the job leaves `compressing`, recording every progress
    /// value seen on the way.
    pub async fn wait_until_settled(&self, id: JobId) -> (JobStatusView, Vec<f64>) {
        let mut seen = Vec::new();
        for _ in 0..500 {
            let view = self.orchestrator.status(id, 0).expect("job vanished");
            seen.push(view.progress);
            if view.status.is_terminal() {
                return (view, seen);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not settle in time");
    }

    /// Paths of every file left under the storage directories.
    pub fn stored_files(&self) -> Vec<std::path::PathBuf> {
        let config = self.orchestrator.config();
        let mut files = Vec::new();
        for dir in [
            &config.storage.upload_dir,
            &config.storage.output_dir,
            &config.storage.work_dir,
        ] {
            collect_files(dir, &mut files);
        }
        files
    }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}
