//! Progress line grammars emitted by the mobile backend on stdout.
//!
//! Two shapes are recognized:
//!
//! - `ACCOUNTING: Track <n>/<m>: ...` while play counts are being recorded
//! - `UPLOAD: [<n>/<m>] <name>` while files are transferred
//!
//! Everything else is free-form log text.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static ACCOUNTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ACCOUNTING:\s*Track\s+(\d+)/(\d+):").expect("valid regex"));

static UPLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"UPLOAD:\s*\[(\d+)/(\d+)\]").expect("valid regex"));

/// Which part of the transfer a progress line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    /// Recording last-played data for the previous playlist.
    Accounting,
    /// Copying files to the device.
    Upload,
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accounting => write!(f, "Accounting"),
            Self::Upload => write!(f, "Uploading"),
        }
    }
}

/// A parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// Phase the counters refer to.
    pub phase: ProgressPhase,
    /// Items done.
    pub current: u64,
    /// Items in total. Zero means indeterminate.
    pub total: u64,
}

impl ProgressUpdate {
    /// Whether the total is unknown.
    pub const fn is_indeterminate(&self) -> bool {
        self.total == 0
    }

    /// Label such as `Uploading: 3/10`.
    pub fn label(&self) -> String {
        if self.is_indeterminate() {
            format!("{}...", self.phase)
        } else {
            format!("{}: {}/{}", self.phase, self.current, self.total)
        }
    }
}

/// Classification of one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// The line carried progress counters.
    Progress(ProgressUpdate),
    /// Free-form text.
    Log,
}

/// Classify a stdout line.
///
/// A line whose current count exceeds a non-zero total is treated as log text
/// so that progress always satisfies `current <= total`.
pub fn parse_line(line: &str) -> OutputLine {
    let matched = ACCOUNTING
        .captures(line)
        .map(|c| (ProgressPhase::Accounting, c))
        .or_else(|| UPLOAD.captures(line).map(|c| (ProgressPhase::Upload, c)));

    let Some((phase, caps)) = matched else {
        return OutputLine::Log;
    };

    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    let (Some(current), Some(total)) = (number(1), number(2)) else {
        return OutputLine::Log;
    };

    if total > 0 && current > total {
        return OutputLine::Log;
    }

    OutputLine::Progress(ProgressUpdate {
        phase,
        current,
        total,
    })
}
