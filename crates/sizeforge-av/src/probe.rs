//! Media probing.
//!
//! [`FfprobeProber`] shells out to `ffprobe -v quiet -print_format json
//! -show_format -show_streams` and keeps the handful of fields the bitrate
//! planner needs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

/// Facts about an input file that drive encoding decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds; `None` when the container does not report a
    /// positive duration.
    pub duration: Option<f64>,
    /// Size in bytes.
    pub size: u64,
    /// Container format name as reported by the prober.
    pub format: String,
    /// Whether the input has at least one audio stream.
    pub has_audio: bool,
}

/// Something that can describe a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Probe the file at `path`.
    async fn probe(&self, path: &Path) -> sizeforge_core::Result<MediaInfo>;
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    /// Create a new prober using the given ffprobe path.
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self { ffprobe_path }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn probe(&self, path: &Path) -> sizeforge_core::Result<MediaInfo> {
        let output = ToolCommand::new(self.ffprobe_path.clone())
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path.to_string_lossy().as_ref())
            .execute()
            .await
            .map_err(|e| sizeforge_core::Error::Probe(e.to_string()))?;

        let fallback_size = tokio::fs::metadata(path).await.map(|m| m.len()).ok();
        parse_ffprobe_json(&output.stdout, fallback_size)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
}

/// Map ffprobe's JSON output into [`MediaInfo`].
///
/// `fallback_size` is used when the container does not report a size.
pub fn parse_ffprobe_json(
    json: &str,
    fallback_size: Option<u64>,
) -> sizeforge_core::Result<MediaInfo> {
    let ff: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| sizeforge_core::Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let duration = ff
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let size = ff
        .format
        .size
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .or(fallback_size)
        .unwrap_or(0);

    let has_audio = ff
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaInfo {
        duration,
        size,
        format: ff.format.format_name.unwrap_or_else(|| "unknown".into()),
        has_audio,
    })
}
