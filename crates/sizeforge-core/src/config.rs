//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries the
//! server, storage, encoder and job sections. Every section defaults sensibly
//! so a completely empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub encoder: EncoderConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string and reject values that
    /// cannot work at all.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Hard validation: values that would make the service unusable.
    pub fn check(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Validation("server.port cannot be 0".into()));
        }
        let margin = self.encoder.bitrate_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            return Err(Error::Validation(format!(
                "encoder.bitrate_margin must be in (0, 1], got {margin}"
            )));
        }
        if self.encoder.audio_bitrate_bps == 0 {
            return Err(Error::Validation(
                "encoder.audio_bitrate_bps cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.jobs.max_concurrent_encodes == 0 {
            warnings.push(
                "jobs.max_concurrent_encodes is 0; concurrent encodes are unbounded".into(),
            );
        }

        if self.storage.allowed_extensions.is_empty() {
            warnings.push("storage.allowed_extensions is empty; every upload will be rejected".into());
        }

        if self.encoder.min_video_bitrate_bps < 32_000 {
            warnings.push(format!(
                "encoder.min_video_bitrate_bps is {}; output below 32 kbps is rarely watchable",
                self.encoder.min_video_bitrate_bps
            ));
        }

        if let Some(ref dir) = self.server.static_dir {
            if !dir.exists() {
                warnings.push(format!("server.static_dir {} does not exist", dir.display()));
            }
        }

        if self.jobs.retention_secs == Some(0) {
            warnings.push("jobs.retention_secs is 0; finished jobs are removed at the next sweep".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding the browser UI, served with an index.html fallback.
    pub static_dir: Option<PathBuf>,
    pub max_upload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            static_dir: None,
            max_upload_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Where uploaded inputs, finished outputs and pass logs live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Parent of the per-job directories holding two-pass statistics files.
    pub work_dir: PathBuf,
    /// Lowercase file extensions accepted at upload.
    pub allowed_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./uploads"),
            output_dir: PathBuf::from("./outputs"),
            work_dir: PathBuf::from("./work"),
            allowed_extensions: ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl StorageConfig {
    /// Whether a client-supplied filename has an accepted extension.
    pub fn accepts(&self, filename: &str) -> bool {
        let Some((_, ext)) = filename.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext))
    }
}

/// External encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate_bps: u64,
    /// Floor below which a computed video bitrate is rejected.
    pub min_video_bitrate_bps: u64,
    /// Multiplier applied to the computed video bitrate, in (0, 1].
    pub bitrate_margin: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            video_codec: "libx264".into(),
            preset: "medium".into(),
            audio_codec: "aac".into(),
            audio_bitrate_bps: 128_000,
            min_video_bitrate_bps: 100_000,
            bitrate_margin: 1.0,
        }
    }
}

/// Job execution and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Encodes allowed to run at once; 0 means no limit.
    pub max_concurrent_encodes: usize,
    /// Finished jobs older than this are cleaned up automatically.
    pub retention_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    /// Trailing encoder lines quoted in an execution error message.
    pub log_tail_lines: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_encodes: 2,
            retention_secs: None,
            sweep_interval_secs: 60,
            log_tail_lines: 20,
        }
    }
}
