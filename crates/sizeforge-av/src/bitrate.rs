//! Target size to encoder bitrate.
//!
//! The whole output budget is `target_bytes * 8` bits spread over the media
//! duration; audio takes a fixed share and video gets the rest:
//!
//! ```text
//! video_bps = (target_bytes * 8 / duration_secs - audio_bps) * margin
//! ```
//!
//! A video bitrate under the configured floor would produce an unwatchable
//! file, so it is reported as [`Error::TargetTooSmall`] instead.

use serde::{Deserialize, Serialize};
use sizeforge_core::config::EncoderConfig;
use sizeforge_core::{Error, Result};

/// Fixed inputs to the calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateParams {
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
    /// Multiplier in (0, 1] applied to the computed video bitrate.
    pub margin: f64,
}

impl Default for BitrateParams {
    fn default() -> Self {
        Self {
            audio_bitrate_bps: 128_000,
            min_video_bitrate_bps: 100_000,
            margin: 1.0,
        }
    }
}

impl From<&EncoderConfig> for BitrateParams {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            audio_bitrate_bps: config.audio_bitrate_bps,
            min_video_bitrate_bps: config.min_video_bitrate_bps,
            margin: config.bitrate_margin,
        }
    }
}

impl BitrateParams {
    /// Parameters for an input with no audio stream: video gets the whole
    /// budget.
    pub fn without_audio(self) -> Self {
        Self {
            audio_bitrate_bps: 0,
            ..self
        }
    }
}

/// Bitrates handed to both encoder passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitratePlan {
    pub video_bitrate_bps: u64,
    /// Zero when the output carries no audio.
    pub audio_bitrate_bps: u64,
}

impl BitratePlan {
    pub fn has_audio(&self) -> bool {
        self.audio_bitrate_bps > 0
    }
}

impl BitratePlan {
    /// Compute the plan for reaching `target_bytes` over `duration_secs`.
    ///
    /// # Errors
    ///
    /// - [`Error::DurationUnavailable`] when the duration is missing or not
    ///   positive.
    /// - [`Error::Validation`] when `target_bytes` is zero.
    /// - [`Error::TargetTooSmall`] when the video bitrate would fall below
    ///   `params.min_video_bitrate_bps`; the error carries the smallest
    ///   target that would work.
    pub fn compute(
        target_bytes: u64,
        duration_secs: Option<f64>,
        params: &BitrateParams,
    ) -> Result<Self> {
        let duration = match duration_secs {
            Some(d) if d.is_finite() && d > 0.0 => d,
            Some(d) => {
                return Err(Error::DurationUnavailable(format!(
                    "duration must be positive, got {d}"
                )))
            }
            None => {
                return Err(Error::DurationUnavailable(
                    "the input does not report a duration".into(),
                ))
            }
        };

        if target_bytes == 0 {
            return Err(Error::Validation("target size must be positive".into()));
        }

        let total_bps = target_bytes as f64 * 8.0 / duration;
        let video_bps = (total_bps - params.audio_bitrate_bps as f64) * params.margin;

        if !(video_bps >= params.min_video_bitrate_bps as f64) {
            return Err(Error::TargetTooSmall {
                requested_bytes: target_bytes,
                minimum_bytes: minimum_target_bytes(duration, params),
            });
        }

        Ok(Self {
            video_bitrate_bps: video_bps.floor() as u64,
            audio_bitrate_bps: params.audio_bitrate_bps,
        })
    }
}

/// Smallest target size whose computed video bitrate reaches the floor.
pub fn minimum_target_bytes(duration_secs: f64, params: &BitrateParams) -> u64 {
    let video_floor = params.min_video_bitrate_bps as f64 / params.margin;
    let bits = (video_floor + params.audio_bitrate_bps as f64) * duration_secs;
    (bits / 8.0).ceil() as u64
}
