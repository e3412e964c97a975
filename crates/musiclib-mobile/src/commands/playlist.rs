//! Playlist listing and preview.

use std::fmt::Write as _;
use std::path::Path;

use musiclib_mobile_core::{PlaylistFormat, Preview};
use serde::Serialize;

use super::{CommandError, Context};

/// One row of the playlist listing.
#[derive(Debug, Serialize)]
struct PlaylistRow<'a> {
    name: &'a str,
    path: &'a Path,
    format: PlaylistFormat,
    selected: bool,
    uploadable: bool,
    recovery: bool,
}

/// `playlists`: list the catalog.
pub fn list(ctx: &mut Context) -> Result<(), CommandError> {
    let sync = ctx.session.sync();
    sync.refresh_playlists()?;

    let catalog = sync.catalog();
    let selected = catalog.selected().map(|e| e.path.as_path());
    let rows: Vec<PlaylistRow<'_>> = catalog
        .entries()
        .iter()
        .map(|e| PlaylistRow {
            name: &e.display_name,
            path: &e.path,
            format: e.format,
            selected: selected == Some(e.path.as_path()),
            uploadable: e.format.supports_upload(),
            recovery: sync.recovery().has_marker_for(&e.display_name),
        })
        .collect();

    let directory = catalog.directory();
    ctx.reporter.result(&rows, || render_rows(&rows, directory));
    Ok(())
}

fn render_rows(rows: &[PlaylistRow<'_>], directory: &Path) -> String {
    if rows.is_empty() {
        return format!("No playlists in {}", directory.display());
    }
    let width = rows.iter().map(|r| r.name.chars().count()).max().unwrap_or(0);
    let mut out = String::new();
    for row in rows {
        let marker = if row.selected { '*' } else { ' ' };
        let _ = write!(
            out,
            "{marker} {:<width$}  {:<5}",
            row.name,
            row.format.extension()
        );
        if !row.uploadable {
            out.push_str("  (view only)");
        }
        if row.recovery {
            out.push_str("  [retry available]");
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

/// `preview`: show the tracks of one playlist.
pub fn preview(ctx: &mut Context, playlist: Option<&str>) -> Result<(), CommandError> {
    let sync = ctx.session.sync();
    sync.refresh_playlists()?;
    let preview = sync.preview(playlist)?;
    ctx.reporter.result(&preview, || render_preview(&preview));
    Ok(())
}

fn render_preview(preview: &Preview) -> String {
    let mut out = format!(
        "{} ({})\n",
        preview.entry.display_name,
        preview.entry.format.describe()
    );
    for (i, track) in preview.tracks.iter().enumerate() {
        let _ = write!(out, "{:>4}. {}", i + 1, track.file_name);
        if !track.exists {
            out.push_str("  [missing]");
        }
        out.push('\n');
    }
    let _ = write!(out, "{}", preview.summary);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use musiclib_mobile_core::{PlaylistEntry, PlaylistSummary, Track};
    use std::path::PathBuf;

    #[test]
    fn test_render_rows() {
        let a = PathBuf::from("/p/Road Trip.audpl");
        let b = PathBuf::from("/p/mix.m3u");
        let rows = vec![
            PlaylistRow {
                name: "Road Trip",
                path: &a,
                format: PlaylistFormat::Audpl,
                selected: true,
                uploadable: true,
                recovery: true,
            },
            PlaylistRow {
                name: "mix",
                path: &b,
                format: PlaylistFormat::M3u,
                selected: false,
                uploadable: false,
                recovery: false,
            },
        ];
        let text = render_rows(&rows, Path::new("/p"));
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "* Road Trip  audpl  [retry available]");
        assert_eq!(lines[1], "  mix        m3u    (view only)");
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_rows(&[], Path::new("/p")), "No playlists in /p");
    }

    #[test]
    fn test_render_preview() {
        let tracks = vec![
            Track {
                path: PathBuf::from("/m/a.mp3"),
                file_name: "a.mp3".to_string(),
                exists: true,
                size_bytes: 1_048_576,
            },
            Track {
                path: PathBuf::from("/m/b.mp3"),
                file_name: "b.mp3".to_string(),
                exists: false,
                size_bytes: 0,
            },
        ];
        let preview = Preview {
            entry: PlaylistEntry::from_path(Path::new("/p/Road Trip.audpl")).unwrap(),
            summary: PlaylistSummary::of(&tracks),
            tracks,
        };
        let text = render_preview(&preview);
        assert!(text.contains("   2. b.mp3  [missing]"));
        assert!(text.ends_with("2 tracks, 1.0 MB total, 1 missing"));
    }
}
