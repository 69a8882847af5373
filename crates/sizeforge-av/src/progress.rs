//! Encoder output to structured progress.
//!
//! ffmpeg reports how much media time it has encoded, either on its stats
//! line (`frame=  240 fps= 48 ... time=00:00:10.00 bitrate=...`, rewritten in
//! place with `\r`) or as `-progress` key lines (`out_time=00:00:10.000000`,
//! `out_time_us=10000000`). The fraction of the pass is that time over the
//! media duration; the ETA extrapolates wall-clock time from the fraction.
//!
//! One [`ProgressParser`] serves exactly one pass and is created fresh for
//! the next.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(?:out_)?time=\s*(-?)(\d+):(\d{1,2}):(\d{1,2}(?:\.\d+)?)")
        .expect("time pattern is valid")
});

static TIME_US_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_(?:us|ms)=(-?\d+)$").expect("time_us pattern is valid"));

static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)speed=\s*(\d+(?:\.\d+)?)x").expect("speed pattern is valid")
});

/// Bare `key=value` lines from `-progress` output and stats lines without a
/// usable timestamp.
static KEY_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*=\S*$").expect("key=value pattern is valid"));

/// Progress of a single pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Fraction of the pass completed, in `[0, 1]`.
    pub fraction: f64,
    /// Media time encoded so far, in seconds.
    pub encoded_secs: f64,
    /// Wall-clock time since the pass started.
    pub elapsed: Duration,
    /// Estimated wall-clock seconds until the pass finishes; `None` until
    /// some progress has been made.
    pub eta_secs: Option<f64>,
    /// Encoding speed as a multiple of real time, when the line reports one.
    pub speed: Option<f64>,
}

/// Classification of one line of encoder output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Progress(ProgressEvent),
    /// Anything the parser does not recognize, forwarded verbatim.
    Diagnostic(String),
    /// Blank lines and progress bookkeeping with nothing to report.
    Ignored,
}

/// Stateless translator from encoder lines to [`ParsedLine`]s for one pass.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_duration: f64,
    started: Instant,
}

impl ProgressParser {
    /// Start parsing a pass over media of `total_duration` seconds.
    pub fn new(total_duration: f64) -> Self {
        Self {
            total_duration,
            started: Instant::now(),
        }
    }

    /// Total media duration this parser measures against.
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    /// Parse a line using the wall-clock time elapsed since construction.
    pub fn parse_line(&self, line: &str) -> ParsedLine {
        self.parse_line_at(line, self.started.elapsed())
    }

    /// Parse a line as if `elapsed` wall-clock time had passed since the
    /// pass started.
    pub fn parse_line_at(&self, line: &str, elapsed: Duration) -> ParsedLine {
        let line = line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return ParsedLine::Ignored;
        }

        if let Some(encoded) = encoded_seconds(trimmed) {
            let speed = encoding_speed(trimmed);
            return ParsedLine::Progress(self.event(encoded, elapsed, speed));
        }

        if KEY_VALUE_RE.is_match(trimmed) || trimmed.contains("time=N/A") {
            return ParsedLine::Ignored;
        }

        ParsedLine::Diagnostic(line.to_string())
    }

    fn event(&self, encoded_secs: f64, elapsed: Duration, speed: Option<f64>) -> ProgressEvent {
        let encoded_secs = encoded_secs.max(0.0);
        let fraction = if self.total_duration > 0.0 {
            (encoded_secs / self.total_duration).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let eta_secs = if fraction > 0.0 {
            Some(elapsed.as_secs_f64() * (1.0 - fraction) / fraction)
        } else {
            None
        };

        ProgressEvent {
            fraction,
            encoded_secs,
            elapsed,
            eta_secs,
            speed,
        }
    }
}

/// Extract the encoded media time from a stats or `-progress` line.
fn encoded_seconds(line: &str) -> Option<f64> {
    if let Some(caps) = TIME_US_RE.captures(line) {
        let micros: i64 = caps[1].parse().ok()?;
        return Some(micros as f64 / 1_000_000.0);
    }

    let caps = TIME_RE.captures(line)?;
    let hours: f64 = caps[2].parse().ok()?;
    let mins: f64 = caps[3].parse().ok()?;
    let secs: f64 = caps[4].parse().ok()?;
    let total = hours * 3600.0 + mins * 60.0 + secs;
    Some(if &caps[1] == "-" { -total } else { total })
}

/// `speed=2.5x` as `2.5`; `speed=N/A` yields nothing.
fn encoding_speed(line: &str) -> Option<f64> {
    SPEED_RE.captures(line)?[1].parse().ok()
}
