//! Retry, cleanup, manual accounting and source refresh.

use musiclib_mobile_core::parse_end_time;
use tracing::warn;

use super::{CommandError, Context};

async fn finish(ctx: &mut Context) -> Result<(), CommandError> {
    ctx.settle().await?;
    ctx.check_failure()
}

/// `retry`: re-run accounting for a playlist with a recovery marker.
pub async fn retry(ctx: &mut Context, playlist: Option<&str>) -> Result<(), CommandError> {
    let sync = ctx.session.sync();
    sync.refresh_playlists()?;
    if let Some(name) = playlist
        && !sync.recovery().has_marker_for(name)
    {
        warn!("No recovery marker for '{}', retrying anyway", name);
    }
    sync.retry(playlist)?;
    finish(ctx).await
}

/// `cleanup`: sweep stale mobile state.
pub async fn cleanup(ctx: &mut Context) -> Result<(), CommandError> {
    let sync = ctx.session.sync();
    sync.refresh_playlists()?;
    sync.cleanup()?;
    finish(ctx).await
}

/// `update-last-played`: accounting without an upload.
pub async fn update_last_played(
    ctx: &mut Context,
    playlist: Option<&str>,
    end_time: Option<&str>,
) -> Result<(), CommandError> {
    let end_time = end_time.map(parse_end_time).transpose()?;
    let sync = ctx.session.sync();
    sync.refresh_playlists()?;
    sync.update_last_played(playlist, end_time)?;
    finish(ctx).await
}

/// `refresh-source`: import playlists from the player.
pub async fn refresh_source(ctx: &mut Context) -> Result<(), CommandError> {
    ctx.session.sync().refresh_from_source()?;
    finish(ctx).await?;

    let count = ctx.session.sync().catalog().entries().len();
    ctx.reporter
        .result(&count, || format!("{count} playlist(s) available"));
    Ok(())
}
