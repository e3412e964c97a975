//! Status display and track rating.

use std::path::Path;

use musiclib_mobile_core::RecoveryMarker;
use serde::Serialize;

use super::{CommandError, Context};

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    text: Option<&'a str>,
    recovery: Vec<&'a RecoveryMarker>,
}

/// `status`: show the backend's status text and pending recovery.
pub async fn show(ctx: &mut Context) -> Result<(), CommandError> {
    ctx.session.sync().refresh_playlists()?;
    let launched = ctx.session.sync().refresh_status();
    ctx.flush();
    launched?;
    ctx.settle().await?;

    let sync = ctx.session.sync();
    let report = StatusReport {
        text: sync.status_text(),
        recovery: sync.recovery().markers().iter().collect(),
    };
    // The status text was already printed as a notification.
    ctx.reporter.result(&report, || recovery_hint(&report.recovery));
    ctx.check_failure()
}

fn recovery_hint(markers: &[&RecoveryMarker]) -> String {
    if markers.is_empty() {
        return String::new();
    }
    let mut names: Vec<&str> = markers.iter().map(|m| m.playlist_name.as_str()).collect();
    names.dedup();
    format!(
        "Interrupted upload(s) can be retried: {}",
        names.join(", ")
    )
}

/// `rate`: write a star rating for one track.
pub async fn rate(ctx: &mut Context, file: &Path, stars: u8) -> Result<(), CommandError> {
    ctx.session.sync().rate(file, stars)?;
    ctx.settle().await?;
    ctx.check_failure()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use musiclib_mobile_core::MarkerKind;

    #[test]
    fn test_recovery_hint() {
        assert_eq!(recovery_hint(&[]), "");

        let pending = RecoveryMarker {
            playlist_name: "Road Trip".to_string(),
            kind: MarkerKind::Pending,
        };
        let failed = RecoveryMarker {
            playlist_name: "Road Trip".to_string(),
            kind: MarkerKind::Failed,
        };
        let other = RecoveryMarker {
            playlist_name: "Workout".to_string(),
            kind: MarkerKind::Failed,
        };
        assert_eq!(
            recovery_hint(&[&pending, &failed, &other]),
            "Interrupted upload(s) can be retried: Road Trip, Workout"
        );
    }
}
