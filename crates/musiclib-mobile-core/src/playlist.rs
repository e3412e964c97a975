//! Playlist catalog.
//!
//! Lists the playlist files in a directory and parses them into ordered track
//! lists. Four formats are understood: Audacious `.audpl`, `.m3u`, `.m3u8`
//! and `.pls`. Only `.audpl` can be uploaded; the others are catalogued for
//! preview.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::error::{Error, FileSystemError, PlaylistError, Result};

/// File in the mobile directory naming the playlist currently on the device.
pub const CURRENT_PLAYLIST_FILE: &str = "current_playlist";

const AUDPL_URI_PREFIX: &str = "uri=file://";

static PLS_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^file\d+\s*=\s*(.*)$").expect("valid regex"));

/// Supported playlist file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistFormat {
    /// Audacious native playlist.
    Audpl,
    /// M3U playlist.
    M3u,
    /// UTF-8 M3U playlist.
    M3u8,
    /// PLS playlist.
    Pls,
}

impl PlaylistFormat {
    /// Format for a file extension, matched case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "audpl" => Some(Self::Audpl),
            "m3u" => Some(Self::M3u),
            "m3u8" => Some(Self::M3u8),
            "pls" => Some(Self::Pls),
            _ => None,
        }
    }

    /// Format of `path`, from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Lowercase extension without the dot.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Audpl => "audpl",
            Self::M3u => "m3u",
            Self::M3u8 => "m3u8",
            Self::Pls => "pls",
        }
    }

    /// Whether the backend can upload playlists of this format.
    pub const fn supports_upload(self) -> bool {
        matches!(self, Self::Audpl)
    }

    /// Human-readable description, e.g. `M3U (.m3u8)`.
    pub fn describe(self) -> String {
        let family = match self {
            Self::Audpl => "Audacious",
            Self::M3u | Self::M3u8 => "M3U",
            Self::Pls => "PLS",
        };
        format!("{family} (.{})", self.extension())
    }
}

impl std::fmt::Display for PlaylistFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// A playlist file found in the catalog directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// Absolute path of the playlist file.
    pub path: PathBuf,
    /// File name without its final extension.
    pub display_name: String,
    /// Detected format.
    pub format: PlaylistFormat,
}

impl PlaylistEntry {
    /// Build an entry for `path`, or `None` if it is not a playlist file.
    pub fn from_path(path: &Path) -> Option<Self> {
        let format = PlaylistFormat::from_path(path)?;
        let display_name = path.file_stem()?.to_string_lossy().into_owned();
        Some(Self {
            path: path.to_path_buf(),
            display_name,
            format,
        })
    }

    /// Reject formats the backend cannot upload.
    pub fn ensure_uploadable(&self) -> Result<()> {
        if self.format.supports_upload() {
            Ok(())
        } else {
            Err(PlaylistError::UploadNotSupported {
                name: self.display_name.clone(),
                format: self.format.extension().to_string(),
            }
            .into())
        }
    }
}

/// A track referenced by a playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    /// Resolved absolute path.
    pub path: PathBuf,
    /// Final path component.
    pub file_name: String,
    /// Whether the file existed when the playlist was parsed.
    pub exists: bool,
    /// File size in bytes, 0 when missing.
    pub size_bytes: u64,
}

impl Track {
    /// Probe `path` and build a track record.
    pub fn probe(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (exists, size_bytes) = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => (true, meta.len()),
            _ => (false, 0),
        };
        Self {
            path,
            file_name,
            exists,
            size_bytes,
        }
    }
}

/// Aggregate figures for a track list.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PlaylistSummary {
    /// Number of tracks.
    pub track_count: usize,
    /// Combined size of the tracks that exist.
    pub total_bytes: u64,
    /// Number of tracks whose file is missing.
    pub missing_count: usize,
}

impl PlaylistSummary {
    /// Summarize `tracks`.
    pub fn of(tracks: &[Track]) -> Self {
        tracks.iter().fold(Self::default(), |mut acc, t| {
            acc.track_count += 1;
            if t.exists {
                acc.total_bytes += t.size_bytes;
            } else {
                acc.missing_count += 1;
            }
            acc
        })
    }

    /// Total size in mebibytes.
    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / 1_048_576.0
    }
}

impl std::fmt::Display for PlaylistSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tracks, {:.1} MB total",
            self.track_count,
            self.total_mb()
        )?;
        if self.missing_count > 0 {
            write!(f, ", {} missing", self.missing_count)?;
        }
        Ok(())
    }
}

// =============================================================================
// Scanning
// =============================================================================

/// List playlist files directly inside `directory`.
///
/// Entries are sorted case-insensitively by file name. A missing directory
/// yields an empty list.
pub fn scan(directory: &Path) -> Result<Vec<PlaylistEntry>> {
    if !directory.is_dir() {
        debug!("Playlist directory {} does not exist", directory.display());
        return Ok(Vec::new());
    }

    let root = std::path::absolute(directory).unwrap_or_else(|_| directory.to_path_buf());
    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", directory.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(playlist) = PlaylistEntry::from_path(entry.path()) {
            entries.push(playlist);
        }
    }

    entries.sort_by_cached_key(|e| {
        e.path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    });
    debug!(
        "Found {} playlists in {}",
        entries.len(),
        directory.display()
    );
    Ok(entries)
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse a playlist file and probe every referenced track.
pub fn parse(path: &Path) -> Result<Vec<Track>> {
    let format = PlaylistFormat::from_path(path).ok_or_else(|| PlaylistError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;

    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileSystem(FileSystemError::NotFound(path.to_path_buf()))
        } else {
            Error::read_failed(path, e)
        }
    })?;
    let content = String::from_utf8_lossy(&bytes);

    let base_dir = playlist_directory(path);
    let tracks: Vec<Track> = track_paths(format, &content, &base_dir, path)
        .into_iter()
        .map(Track::probe)
        .collect();

    debug!("Parsed {} tracks from {}", tracks.len(), path.display());
    Ok(tracks)
}

/// Extract track paths from playlist text without touching the filesystem.
///
/// Relative entries are joined to `base_dir`. `source` only labels log lines.
pub fn track_paths(
    format: PlaylistFormat,
    content: &str,
    base_dir: &Path,
    source: &Path,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        let parsed = match format {
            PlaylistFormat::Audpl => audpl_line(line),
            PlaylistFormat::M3u | PlaylistFormat::M3u8 => Ok(m3u_line(line, base_dir)),
            PlaylistFormat::Pls => pls_line(line, base_dir),
        };
        match parsed {
            Ok(Some(p)) => paths.push(p),
            Ok(None) => {}
            Err(reason) => {
                let err = PlaylistError::ParseFailure {
                    path: source.to_path_buf(),
                    line: index + 1,
                    reason,
                };
                debug!("Skipping line: {}", err);
            }
        }
    }
    paths
}

fn audpl_line(line: &str) -> std::result::Result<Option<PathBuf>, String> {
    let Some(encoded) = line.strip_prefix(AUDPL_URI_PREFIX) else {
        return Ok(None);
    };
    urlencoding::decode(encoded)
        .map(|decoded| Some(PathBuf::from(decoded.into_owned())))
        .map_err(|e| format!("invalid percent-encoding: {e}"))
}

fn m3u_line(line: &str, base_dir: &Path) -> Option<PathBuf> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(resolve(Path::new(line), base_dir))
}

fn pls_line(line: &str, base_dir: &Path) -> std::result::Result<Option<PathBuf>, String> {
    let Some(caps) = PLS_ENTRY.captures(line) else {
        return Ok(None);
    };
    let value = caps.get(1).map_or("", |m| m.as_str()).trim();
    if value.is_empty() {
        return Err("empty file entry".to_string());
    }
    if value.starts_with("file://") {
        let url = Url::parse(value).map_err(|e| format!("invalid file URL: {e}"))?;
        let path = url
            .to_file_path()
            .map_err(|()| format!("not a local file URL: {value}"))?;
        return Ok(Some(path));
    }
    Ok(Some(resolve(Path::new(value), base_dir)))
}

fn resolve(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn playlist_directory(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute
        .parent()
        .map_or_else(|| PathBuf::from("/"), Path::to_path_buf)
}

// =============================================================================
// Selection
// =============================================================================

/// Read the name of the playlist currently on the device, if recorded.
pub fn current_device_playlist(mobile_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(mobile_dir.join(CURRENT_PLAYLIST_FILE)).ok()?;
    let name = content.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Choose which entry to select after a rescan.
///
/// Keeps `previous` if it is still listed, then prefers the playlist that is
/// currently on the device, then falls back to the first entry.
pub fn default_selection(
    entries: &[PlaylistEntry],
    previous: Option<&Path>,
    on_device: Option<&str>,
) -> Option<usize> {
    if let Some(prev) = previous
        && let Some(idx) = entries.iter().position(|e| e.path == prev)
    {
        return Some(idx);
    }
    if let Some(name) = on_device
        && let Some(idx) = entries.iter().position(|e| e.display_name == name)
    {
        return Some(idx);
    }
    (!entries.is_empty()).then_some(0)
}

/// Snapshot of the playlist directory plus the current selection.
#[derive(Debug, Clone)]
pub struct PlaylistCatalog {
    directory: PathBuf,
    entries: Vec<PlaylistEntry>,
    selected: Option<usize>,
}

impl PlaylistCatalog {
    /// Create an empty catalog for `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            entries: Vec::new(),
            selected: None,
        }
    }

    /// Directory being catalogued.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Current entries.
    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    /// Currently selected entry.
    pub fn selected(&self) -> Option<&PlaylistEntry> {
        self.selected.and_then(|i| self.entries.get(i))
    }

    /// Rescan the directory and reapply the default selection.
    pub fn refresh(&mut self, mobile_dir: &Path) -> Result<&[PlaylistEntry]> {
        let previous = self.selected().map(|e| e.path.clone());
        self.entries = scan(&self.directory)?;
        let on_device = current_device_playlist(mobile_dir);
        self.selected = default_selection(&self.entries, previous.as_deref(), on_device.as_deref());
        info!(
            "Catalog refreshed: {} playlists, selected {:?}",
            self.entries.len(),
            self.selected().map(|e| e.display_name.as_str())
        );
        Ok(&self.entries)
    }

    /// Select the playlist with the given display name or path.
    pub fn select(&mut self, name_or_path: &str) -> Result<&PlaylistEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.display_name == name_or_path || e.path == Path::new(name_or_path))
            .ok_or_else(|| PlaylistError::NotFound(name_or_path.to_string()))?;
        self.selected = Some(idx);
        Ok(&self.entries[idx])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_format_from_extension_case_insensitive() {
        assert_eq!(PlaylistFormat::from_extension("AUDPL"), Some(PlaylistFormat::Audpl));
        assert_eq!(PlaylistFormat::from_extension("M3u8"), Some(PlaylistFormat::M3u8));
        assert_eq!(PlaylistFormat::from_extension("xspf"), None);
        assert!(PlaylistFormat::Audpl.supports_upload());
        assert!(!PlaylistFormat::Pls.supports_upload());
        assert_eq!(PlaylistFormat::M3u8.describe(), "M3U (.m3u8)");
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "zeta.m3u", "");
        write(dir.path(), "Alpha.audpl", "");
        write(dir.path(), "beta.PLS", "");
        write(dir.path(), "notes.txt", "");
        write(dir.path(), "cover.jpg", "");
        fs::create_dir(dir.path().join("sub.m3u")).unwrap();

        let entries = scan(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "zeta"]);
        assert_eq!(entries[1].format, PlaylistFormat::Pls);
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let entries = scan(Path::new("/nonexistent/playlists")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_display_name_strips_final_extension_only() {
        let entry = PlaylistEntry::from_path(Path::new("/p/Best.of.2024.audpl")).unwrap();
        assert_eq!(entry.display_name, "Best.of.2024");
    }

    #[test]
    fn test_audpl_decodes_uris() {
        let content = "title=Road%20Trip\nuri=file:///music/A%20B/01%20Song.mp3\ntitle=x\n  uri=file:///music/c.flac\n";
        let paths = track_paths(
            PlaylistFormat::Audpl,
            content,
            Path::new("/p"),
            Path::new("/p/x.audpl"),
        );
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/music/A B/01 Song.mp3"),
                PathBuf::from("/music/c.flac")
            ]
        );
    }

    #[test]
    fn test_m3u_resolves_relative_paths() {
        let content = "#EXTM3U\n#EXTINF:123,Artist - Title\nsub/a.mp3\n\n/abs/b.mp3\n";
        let paths = track_paths(
            PlaylistFormat::M3u,
            content,
            Path::new("/playlists"),
            Path::new("/playlists/p.m3u"),
        );
        assert_eq!(
            paths,
            vec![PathBuf::from("/playlists/sub/a.mp3"), PathBuf::from("/abs/b.mp3")]
        );
    }

    #[test]
    fn test_pls_entries() {
        let content = "[playlist]\nNumberOfEntries=3\nFile1=/music/a.mp3\nTitle1=A\nfile2 = file:///music/b%20c.mp3\nFILE3=rel/d.mp3\nFile4=\n";
        let paths = track_paths(
            PlaylistFormat::Pls,
            content,
            Path::new("/p"),
            Path::new("/p/x.pls"),
        );
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/music/a.mp3"),
                PathBuf::from("/music/b c.mp3"),
                PathBuf::from("/p/rel/d.mp3"),
            ]
        );
    }

    #[test]
    fn test_parse_probes_existence_and_size() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        fs::create_dir(&music).unwrap();
        fs::write(music.join("a.mp3"), vec![0u8; 2048]).unwrap();
        let playlist = write(dir.path(), "p.m3u", "music/a.mp3\nmusic/missing.mp3\n");

        let tracks = parse(&playlist).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].exists);
        assert_eq!(tracks[0].size_bytes, 2048);
        assert_eq!(tracks[0].file_name, "a.mp3");
        assert!(!tracks[1].exists);
        assert_eq!(tracks[1].size_bytes, 0);

        let summary = PlaylistSummary::of(&tracks);
        assert_eq!(summary.track_count, 2);
        assert_eq!(summary.total_bytes, 2048);
        assert_eq!(summary.missing_count, 1);
    }

    #[test]
    fn test_parse_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        let playlist = write(
            dir.path(),
            "p.audpl",
            "uri=file:///x/1.mp3\nuri=file:///x/2.mp3\nuri=file:///x/1.mp3\n",
        );
        assert_eq!(parse(&playlist).unwrap(), parse(&playlist).unwrap());
    }

    #[test]
    fn test_parse_missing_file_is_error() {
        let err = parse(Path::new("/nonexistent/p.m3u")).unwrap_err();
        assert!(matches!(
            err,
            Error::FileSystem(FileSystemError::NotFound(_))
        ));
    }

    #[test]
    fn test_summary_display() {
        let summary = PlaylistSummary {
            track_count: 12,
            total_bytes: 3 * 1_048_576 + 524_288,
            missing_count: 0,
        };
        assert_eq!(summary.to_string(), "12 tracks, 3.5 MB total");

        let summary = PlaylistSummary {
            missing_count: 2,
            ..summary
        };
        assert_eq!(summary.to_string(), "12 tracks, 3.5 MB total, 2 missing");
    }

    #[test]
    fn test_default_selection_order() {
        let entries: Vec<_> = ["/p/a.audpl", "/p/b.audpl", "/p/c.m3u"]
            .iter()
            .filter_map(|p| PlaylistEntry::from_path(Path::new(p)))
            .collect();

        assert_eq!(
            default_selection(&entries, Some(Path::new("/p/c.m3u")), Some("b")),
            Some(2)
        );
        assert_eq!(
            default_selection(&entries, Some(Path::new("/p/gone.audpl")), Some("b")),
            Some(1)
        );
        assert_eq!(default_selection(&entries, None, Some("zzz")), Some(0));
        assert_eq!(default_selection(&[], None, None), None);
    }

    #[test]
    fn test_catalog_refresh_uses_current_playlist_marker() {
        let playlists = TempDir::new().unwrap();
        let mobile = TempDir::new().unwrap();
        write(playlists.path(), "a.audpl", "");
        write(playlists.path(), "b.audpl", "");
        write(mobile.path(), CURRENT_PLAYLIST_FILE, "b\n");

        let mut catalog = PlaylistCatalog::new(playlists.path());
        catalog.refresh(mobile.path()).unwrap();
        assert_eq!(catalog.selected().unwrap().display_name, "b");

        catalog.select("a").unwrap();
        catalog.refresh(mobile.path()).unwrap();
        assert_eq!(catalog.selected().unwrap().display_name, "a");
    }

    #[test]
    fn test_ensure_uploadable() {
        let entry = PlaylistEntry::from_path(Path::new("/p/x.m3u")).unwrap();
        let err = entry.ensure_uploadable().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejected);
        assert!(err.to_string().contains("not yet supported"));
    }
}
