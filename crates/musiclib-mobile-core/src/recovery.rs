//! Recovery markers left behind by interrupted uploads.
//!
//! The backend writes `<playlist>.pending_tracks` when accounting was cut
//! short and `<playlist>.failed` when it gave up. Their presence enables the
//! Retry action. The cleanup sweep must leave the state of the selected
//! playlist and of every playlist with a marker untouched; the tracker takes a
//! snapshot before the sweep and checks it afterwards.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::process::Invocation;

const PENDING_SUFFIX: &str = ".pending_tracks";
const FAILED_SUFFIX: &str = ".failed";

/// Kind of recovery marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    /// Accounting has tracks left to process.
    Pending,
    /// Accounting failed.
    Failed,
}

/// A marker file in the mobile state directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecoveryMarker {
    /// Playlist the marker belongs to.
    pub playlist_name: String,
    /// Marker kind.
    pub kind: MarkerKind,
}

impl RecoveryMarker {
    /// Recognize a marker from its file name.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (name, kind) = if let Some(name) = file_name.strip_suffix(PENDING_SUFFIX) {
            (name, MarkerKind::Pending)
        } else if let Some(name) = file_name.strip_suffix(FAILED_SUFFIX) {
            (name, MarkerKind::Failed)
        } else {
            return None;
        };
        (!name.is_empty()).then(|| Self {
            playlist_name: name.to_string(),
            kind,
        })
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

/// Scan `mobile_dir` for recovery markers.
pub fn scan(mobile_dir: &Path) -> BTreeSet<RecoveryMarker> {
    let markers: BTreeSet<_> = file_names(mobile_dir)
        .iter()
        .filter_map(|n| RecoveryMarker::from_file_name(n))
        .collect();
    debug!(
        "Found {} recovery marker(s) in {}",
        markers.len(),
        mobile_dir.display()
    );
    markers
}

/// Files in the mobile directory that belong to one of `names`.
///
/// A file belongs to playlist `p` when its name is `p` or starts with `p.`.
pub fn owned_state(mobile_dir: &Path, names: &BTreeSet<String>) -> BTreeSet<PathBuf> {
    file_names(mobile_dir)
        .into_iter()
        .filter(|file| {
            names
                .iter()
                .any(|n| file == n || file.strip_prefix(n.as_str()).is_some_and(|r| r.starts_with('.')))
        })
        .map(|file| mobile_dir.join(file))
        .collect()
}

/// Playlist state captured before a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupGuard {
    /// Playlists whose state must survive.
    pub preserved: BTreeSet<String>,
    /// Files that must still exist afterwards.
    pub protected_files: BTreeSet<PathBuf>,
}

impl CleanupGuard {
    /// Snapshot what the sweep must not touch.
    pub fn capture(mobile_dir: &Path, selected: Option<&str>, markers: &BTreeSet<RecoveryMarker>) -> Self {
        let preserved: BTreeSet<String> = markers
            .iter()
            .map(|m| m.playlist_name.clone())
            .chain(selected.map(str::to_string))
            .collect();
        let protected_files = owned_state(mobile_dir, &preserved);
        debug!(
            "Cleanup will preserve {:?} ({} files)",
            preserved,
            protected_files.len()
        );
        Self {
            preserved,
            protected_files,
        }
    }

    /// Protected files that no longer exist.
    pub fn violations(&self) -> Vec<PathBuf> {
        self.protected_files
            .iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect()
    }
}

/// Current recovery state of the mobile directory.
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    mobile_dir: PathBuf,
    markers: BTreeSet<RecoveryMarker>,
}

impl RecoveryTracker {
    /// Create a tracker for `mobile_dir`. Call [`Self::rescan`] to populate it.
    pub fn new(mobile_dir: impl Into<PathBuf>) -> Self {
        Self {
            mobile_dir: mobile_dir.into(),
            markers: BTreeSet::new(),
        }
    }

    /// The mobile state directory.
    pub fn mobile_dir(&self) -> &Path {
        &self.mobile_dir
    }

    /// Re-read markers from disk. Returns whether recovery is available.
    pub fn rescan(&mut self) -> bool {
        self.markers = scan(&self.mobile_dir);
        self.has_recovery()
    }

    /// Markers found by the last scan.
    pub const fn markers(&self) -> &BTreeSet<RecoveryMarker> {
        &self.markers
    }

    /// Whether any marker exists.
    pub fn has_recovery(&self) -> bool {
        !self.markers.is_empty()
    }

    /// Whether `playlist_name` has a marker.
    pub fn has_marker_for(&self, playlist_name: &str) -> bool {
        self.markers.iter().any(|m| m.playlist_name == playlist_name)
    }

    /// Invocation retrying accounting for one playlist.
    pub fn retry_invocation(&self, script: &str, playlist_name: &str) -> Invocation {
        Invocation::script(script).arg("retry").arg(playlist_name)
    }

    /// Invocation of the cleanup sweep, with the guard to verify afterwards.
    pub fn cleanup_invocation(&self, script: &str, selected: Option<&str>) -> (Invocation, CleanupGuard) {
        let guard = CleanupGuard::capture(&self.mobile_dir, selected, &self.markers);
        (Invocation::script(script).arg("cleanup"), guard)
    }
}
