//! Staleness gate run before an upload.
//!
//! The backend's `check-update <name>` reports whether the player's copy of a
//! playlist is newer than the one in the upload directory. Only an
//! unambiguous answer halts the upload; anything unclear lets it proceed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::process::{Invocation, OperationOutcome, Termination};

static STATUS_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"STATUS:(newer|new)\b").expect("valid regex"));

/// Result of the staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    /// Upload may proceed.
    Clear,
    /// The source copy was modified after the local one.
    Newer,
    /// The playlist exists only in the source.
    New,
}

impl GateVerdict {
    /// Whether the upload should halt.
    pub const fn is_stale(self) -> bool {
        matches!(self, Self::Newer | Self::New)
    }

    /// Message shown when the upload halts.
    pub fn halt_message(self, playlist: &str) -> Option<String> {
        match self {
            Self::Clear => None,
            Self::Newer => Some(format!(
                "The player has a newer version of '{playlist}'. Refresh playlists before uploading."
            )),
            Self::New => Some(format!(
                "'{playlist}' has not been imported from the player yet. Refresh playlists before uploading."
            )),
        }
    }
}

impl std::fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clear => write!(f, "clear"),
            Self::Newer => write!(f, "newer"),
            Self::New => write!(f, "new"),
        }
    }
}

/// Invocation of the check for `playlist_name`.
pub fn check_invocation(script: &str, playlist_name: &str) -> Invocation {
    Invocation::script(script)
        .arg("check-update")
        .arg(playlist_name)
        .captured()
}

/// Interpret the outcome of a check operation.
///
/// Stale only when the process exited normally with code 0 and its output
/// contains `STATUS:newer` or `STATUS:new`, but not both.
pub fn interpret(outcome: &OperationOutcome) -> GateVerdict {
    if outcome.termination != Termination::Exited || outcome.exit_code != Some(0) {
        debug!(
            "check-update ended with {:?}/{:?}, treating as clear",
            outcome.termination, outcome.exit_code
        );
        return GateVerdict::Clear;
    }

    let tokens: BTreeSet<&str> = STATUS_TOKEN
        .captures_iter(&outcome.stdout)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect();

    if tokens.len() != 1 {
        debug!("check-update reported {:?}, treating as clear", tokens);
        return GateVerdict::Clear;
    }

    match tokens.first().copied() {
        Some("newer") => GateVerdict::Newer,
        Some("new") => GateVerdict::New,
        _ => GateVerdict::Clear,
    }
}
