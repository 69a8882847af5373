//! Unified error type for sizeforge.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for the HTTP layer to derive a status code via [`Error::http_status`] and a
//! stable machine-readable kind via [`Error::code`].

use std::fmt;

/// Unified error type covering all failure modes in sizeforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The request conflicts with the current state of the resource.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested size cannot be reached with a usable video bitrate.
    #[error(
        "Target size of {requested_bytes} bytes is too small for this video; \
         the minimum achievable size is about {minimum_bytes} bytes"
    )]
    TargetTooSmall {
        /// The size the caller asked for.
        requested_bytes: u64,
        /// Smallest size that still leaves the minimum video bitrate.
        minimum_bytes: u64,
    },

    /// The input's duration could not be determined.
    #[error("Video duration unavailable: {0}")]
    DurationUnavailable(String),

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// An external tool (ffmpeg, ffprobe) could not be run or reported an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An encoder pass failed.
    #[error("Encoding pass {pass} failed: {message}")]
    Encode {
        /// The pass that failed (1 or 2).
        pass: u8,
        /// Exit status plus the tail of the encoder's diagnostic output.
        message: String,
    },

    /// The operation was cancelled before it finished.
    #[error("Cancelled")]
    Cancelled,

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::TargetTooSmall { .. } => 422,
            Error::DurationUnavailable(_) => 422,
            Error::Probe(_) => 422,
            Error::Tool { .. } => 502,
            Error::Encode { .. } => 502,
            Error::Cancelled => 500,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Stable snake_case name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Conflict(_) => "conflict",
            Error::TargetTooSmall { .. } => "target_too_small",
            Error::DurationUnavailable(_) => "duration_unavailable",
            Error::Probe(_) => "probe_error",
            Error::Tool { .. } => "tool_error",
            Error::Encode { .. } => "encode_error",
            Error::Cancelled => "cancelled",
            Error::Io { .. } => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Encode`].
    pub fn encode(pass: u8, message: impl Into<String>) -> Self {
        Error::Encode {
            pass,
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
