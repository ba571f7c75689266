//! Relay stderr parsing.
//!
//! The relay process reports through stderr only: newline-terminated
//! key=value progress records (from "-progress pipe:2"), the classic
//! single-line stats format, and free-form diagnostics. Progress lines are
//! turned into [`ProgressUpdate`]s; diagnostics are kept in a bounded ring
//! so the last words of a dying process survive for failure diagnosis.

use std::collections::VecDeque;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;

/// Lines of stderr retained for post-mortem diagnosis.
const RING_CAPACITY: usize = 40;

/// Fields extracted from one progress line. Counters are cumulative for
/// the lifetime of the current process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub frames: Option<u64>,
    pub bytes: Option<u64>,
    pub dropped: Option<u64>,
}

impl ProgressUpdate {
    fn is_empty(&self) -> bool {
        self.fps.is_none()
            && self.bitrate_kbps.is_none()
            && self.frames.is_none()
            && self.bytes.is_none()
            && self.dropped.is_none()
    }
}

/// How one stderr line should be treated.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    /// Carries at least one metric field.
    Progress(ProgressUpdate),
    /// A progress-record field with nothing we track (out_time=, speed=, ...).
    Status,
    /// Anything else; worth keeping for diagnosis.
    Diagnostic,
}

pub struct ProgressParser {
    fps: Regex,
    bitrate: Regex,
    frame: Regex,
    size_kib: Regex,
    total_size: Regex,
    dropped: Regex,
    progress_field: Regex,
}

impl ProgressParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fps: Regex::new(r"fps=\s*([0-9]+(?:\.[0-9]+)?)")?,
            bitrate: Regex::new(r"bitrate=\s*([0-9]+(?:\.[0-9]+)?)\s*kbits/s")?,
            frame: Regex::new(r"frame=\s*([0-9]+)")?,
            size_kib: Regex::new(r"size=\s*([0-9]+)\s*[kK]i?B")?,
            total_size: Regex::new(r"total_size=\s*([0-9]+)")?,
            dropped: Regex::new(r"drop(?:_frames)?=\s*([0-9]+)")?,
            progress_field: Regex::new(r"^[A-Za-z0-9_.]+=")?,
        })
    }

    /// Extracts metric fields from a line, if it carries any.
    pub fn parse_progress(&self, line: &str) -> Option<ProgressUpdate> {
        let update = ProgressUpdate {
            fps: self.capture_f64(&self.fps, line),
            bitrate_kbps: self.capture_f64(&self.bitrate, line),
            frames: self.capture_u64(&self.frame, line),
            bytes: self
                .capture_u64(&self.total_size, line)
                .or_else(|| self.capture_u64(&self.size_kib, line).map(|kib| kib * 1024)),
            dropped: self.capture_u64(&self.dropped, line),
        };
        if update.is_empty() {
            None
        } else {
            Some(update)
        }
    }

    pub fn classify_line(&self, line: &str) -> LineClass {
        if let Some(update) = self.parse_progress(line) {
            return LineClass::Progress(update);
        }
        if self.progress_field.is_match(line) {
            return LineClass::Status;
        }
        LineClass::Diagnostic
    }

    fn capture_f64(&self, re: &Regex, line: &str) -> Option<f64> {
        re.captures(line)?.get(1)?.as_str().parse().ok()
    }

    fn capture_u64(&self, re: &Regex, line: &str) -> Option<u64> {
        re.captures(line)?.get(1)?.as_str().parse().ok()
    }
}

/// Why a relay process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote side (camera or media server) was unreachable.
    ConnectionFailed,
    /// Credentials were rejected.
    AuthFailed,
    /// Anything else: crash, bad arguments, signal.
    ProcessCrash,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConnectionFailed => "connection_failed",
            Self::AuthFailed => "auth_failed",
            Self::ProcessCrash => "process_crash",
        };
        f.write_str(s)
    }
}

const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "authentication",
    "authorization failed",
];

const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "connection reset",
    "no route to host",
    "network is unreachable",
    "host is unreachable",
    "name or service not known",
    "failed to connect",
    "could not connect",
    "timed out",
];

/// Classifies a process exit from the retained stderr tail.
///
/// Auth markers are checked first: a rejected-credentials line often also
/// mentions the connection, and the more specific cause wins.
#[must_use]
pub fn classify_failure(stderr_tail: &str) -> FailureKind {
    let lower = stderr_tail.to_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::AuthFailed;
    }
    if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::ConnectionFailed;
    }
    FailureKind::ProcessCrash
}

/// Bounded ring of recent diagnostic lines.
#[derive(Debug, Default)]
pub struct StderrRing {
    lines: VecDeque<String>,
}

impl StderrRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: &str) {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return;
        }
        if self.lines.len() == RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(trimmed.to_string());
    }

    /// Joins the retained lines, newest last.
    #[must_use]
    pub fn tail(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }

    /// The last retained line, if any.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
