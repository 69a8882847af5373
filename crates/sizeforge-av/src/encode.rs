//! Supervised encoder passes.
//!
//! A two-pass encode runs ffmpeg twice over the same input with the same
//! video bitrate. Pass 1 ([`Pass::Analysis`]) writes rate-control statistics
//! next to `passlog_prefix` and discards its media output; pass 2
//! ([`Pass::Encode`]) reads those statistics and writes the final MP4.
//!
//! [`FfmpegEncoder`] spawns one pass, splits its stderr on `\r` and `\n`,
//! feeds each line through a fresh [`ProgressParser`] and reports the results
//! through a callback. Cancelling the token kills the child and waits for it
//! to exit before returning.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sizeforge_core::config::EncoderConfig;
use sizeforge_core::{Error, Result};
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::bitrate::BitratePlan;
use crate::progress::{ParsedLine, ProgressEvent, ProgressParser};

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// One of the two encoder passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Analysis,
    Encode,
}

impl Pass {
    /// The value passed to ffmpeg's `-pass` flag.
    pub fn number(self) -> u8 {
        match self {
            Pass::Analysis => 1,
            Pass::Encode => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pass::Analysis => "analysis",
            Pass::Encode => "encode",
        }
    }
}

/// Everything needed to run a single pass.
#[derive(Debug, Clone)]
pub struct PassSpec {
    pub pass: Pass,
    pub input: PathBuf,
    /// Final output file; only written by [`Pass::Encode`].
    pub output: PathBuf,
    /// Prefix for ffmpeg's two-pass statistics files. Both passes of one
    /// encode must use the same prefix.
    pub passlog_prefix: PathBuf,
    pub plan: BitratePlan,
    /// Input duration in seconds, the denominator for progress.
    pub duration: f64,
}

/// Something reported by a running pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassUpdate {
    Progress(ProgressEvent),
    /// A diagnostic line from the encoder, verbatim.
    Log(String),
}

/// Runs encoder passes.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Run one pass to completion, delivering progress and diagnostics to
    /// `on_update` as they arrive.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] once `cancel` fires; the encoder process has
    ///   exited by the time this returns.
    /// - [`Error::Encode`] when the process cannot be started, its output
    ///   stream breaks, or it exits unsuccessfully.
    async fn run_pass(
        &self,
        spec: &PassSpec,
        on_update: &mut (dyn FnMut(PassUpdate) + Send),
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Build the ffmpeg argument vector for one pass.
pub fn build_args(spec: &PassSpec, config: &EncoderConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-nostdin".into(),
        "-hide_banner".into(),
        "-i".into(),
        spec.input.to_string_lossy().into_owned(),
        "-c:v".into(),
        config.video_codec.clone(),
        "-preset".into(),
        config.preset.clone(),
        "-b:v".into(),
        spec.plan.video_bitrate_bps.to_string(),
        "-pass".into(),
        spec.pass.number().to_string(),
        "-passlogfile".into(),
        spec.passlog_prefix.to_string_lossy().into_owned(),
    ];

    match spec.pass {
        Pass::Analysis => {
            args.extend(["-an", "-f", "null", NULL_DEVICE].map(String::from));
        }
        Pass::Encode => {
            if spec.plan.has_audio() {
                args.extend([
                    "-c:a".to_string(),
                    config.audio_codec.clone(),
                    "-b:a".to_string(),
                    spec.plan.audio_bitrate_bps.to_string(),
                ]);
            } else {
                args.push("-an".into());
            }
            args.extend([
                "-movflags".to_string(),
                "+faststart".to_string(),
                spec.output.to_string_lossy().into_owned(),
            ]);
        }
    }

    args
}

/// [`Encoder`] backed by the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    config: EncoderConfig,
    log_tail_lines: usize,
}

impl FfmpegEncoder {
    /// `log_tail_lines` is how many trailing diagnostic lines are quoted in
    /// the error of a failed pass.
    pub fn new(ffmpeg_path: PathBuf, config: EncoderConfig, log_tail_lines: usize) -> Self {
        Self {
            ffmpeg_path,
            config,
            log_tail_lines,
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn run_pass(
        &self,
        spec: &PassSpec,
        on_update: &mut (dyn FnMut(PassUpdate) + Send),
        cancel: CancellationToken,
    ) -> Result<()> {
        let pass = spec.pass.number();
        let args = build_args(spec, &self.config);

        tracing::debug!(pass, "Running {} {:?}", self.ffmpeg_path.display(), args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::encode(
                    pass,
                    format!("failed to spawn {}: {e}", self.ffmpeg_path.display()),
                )
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::encode(pass, "encoder stderr was not captured"))?;
        let mut lines = FramedRead::new(stderr, AnyDelimiterCodec::new(b"\r\n".to_vec(), Vec::new()));

        let parser = ProgressParser::new(spec.duration);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.log_tail_lines);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(pass, "Encoder cancelled, killing process");
                    let _ = child.kill().await;
                    return Err(Error::Cancelled);
                }
                frame = lines.next() => match frame {
                    Some(Ok(frame)) => {
                        match parser.parse_line(&decode_line(&frame)) {
                            ParsedLine::Progress(event) => on_update(PassUpdate::Progress(event)),
                            ParsedLine::Diagnostic(text) => {
                                if self.log_tail_lines > 0 {
                                    if tail.len() == self.log_tail_lines {
                                        tail.pop_front();
                                    }
                                    tail.push_back(text.clone());
                                }
                                on_update(PassUpdate::Log(text));
                            }
                            ParsedLine::Ignored => {}
                        }
                    }
                    Some(Err(e)) => {
                        let _ = child.kill().await;
                        return Err(Error::encode(pass, format!("encoder output stream failed: {e}")));
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(pass, "Encoder cancelled, killing process");
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => status.map_err(|e| {
                Error::encode(pass, format!("failed to wait for encoder: {e}"))
            })?,
        };

        if !status.success() {
            let mut message = format!("ffmpeg exited with {status}");
            if !tail.is_empty() {
                message.push_str(":\n");
                message.push_str(&tail.make_contiguous().join("\n"));
            }
            return Err(Error::encode(pass, message));
        }

        tracing::debug!(pass, "Encoder pass finished");
        Ok(())
    }
}

fn decode_line(frame: &Bytes) -> String {
    String::from_utf8_lossy(frame).into_owned()
}
