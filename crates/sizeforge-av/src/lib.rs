//! # sizeforge-av
//!
//! Everything in sizeforge that touches the external encoder:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for short-lived tool invocations.
//! - **Probing** ([`Prober`], [`FfprobeProber`]) -- duration and size of an input.
//! - **Bitrate planning** ([`BitratePlan`]) -- target size to video bitrate.
//! - **Progress parsing** ([`ProgressParser`]) -- encoder stderr to progress/ETA.
//! - **Encoding** ([`Encoder`], [`FfmpegEncoder`]) -- one supervised pass of a
//!   two-pass encode, with cancellation.

pub mod bitrate;
pub mod command;
pub mod encode;
pub mod probe;
pub mod progress;
pub mod tools;

pub use bitrate::{BitrateParams, BitratePlan};
pub use command::{ToolCommand, ToolOutput};
pub use encode::{Encoder, FfmpegEncoder, Pass, PassSpec, PassUpdate};
pub use probe::{FfprobeProber, MediaInfo, Prober};
pub use progress::{ParsedLine, ProgressEvent, ProgressParser};
pub use tools::{ToolInfo, ToolRegistry};
