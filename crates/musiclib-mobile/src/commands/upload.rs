//! The `upload` command.

use clap::Args;
use musiclib_mobile_core::{
    Error, ErrorKind, PipelineState, UploadOptions, UploadSession, parse_end_time,
};

use super::{CommandError, Context};

/// Arguments of `upload`.
#[derive(Debug, Clone, Default, Args)]
pub struct UploadArgs {
    /// Playlist name or path (defaults to the current selection)
    #[arg(short, long)]
    pub playlist: Option<String>,
    /// Device id (defaults to the configured or first reachable device)
    #[arg(short, long)]
    pub device: Option<String>,
    /// Stop if the player has a newer copy of the playlist
    #[arg(long)]
    pub halt_if_newer: bool,
    /// When the previous playlist stopped playing
    #[arg(long, value_name = "MM/DD/YYYY HH:MM:SS")]
    pub end_time: Option<String>,
}

/// `upload`: pick playlist and device, then run the pipeline to its end.
pub async fn run(ctx: &mut Context, args: &UploadArgs) -> Result<(), CommandError> {
    let end_time = args.end_time.as_deref().map(parse_end_time).transpose()?;

    let sync = ctx.session.sync();
    sync.refresh_playlists()?;
    if let Some(playlist) = &args.playlist {
        sync.select_playlist(playlist)?;
    }
    sync.scan_devices()?;
    ctx.settle().await?;

    if let Some(device) = &args.device {
        ctx.session.sync().select_device(device)?;
    }

    ctx.session.sync().request_upload(UploadOptions {
        halt_if_newer: args.halt_if_newer,
        end_time,
    })?;
    ctx.settle().await?;

    let session = ctx
        .session
        .sync()
        .session()
        .cloned()
        .ok_or_else(|| Error::Internal("upload session missing".to_string()))?;
    ctx.reporter.result(&session, String::new);
    outcome(&session)
}

fn outcome(session: &UploadSession) -> Result<(), CommandError> {
    match session.state {
        PipelineState::Completed => Ok(()),
        PipelineState::Halted => Err(CommandError::Halted(
            session
                .verdict
                .and_then(|v| v.halt_message(&session.playlist_name))
                .unwrap_or_else(|| "Upload halted".to_string()),
        )),
        state => Err(CommandError::Reported {
            kind: if session.deferred {
                ErrorKind::Deferred
            } else {
                ErrorKind::ExternalFailure
            },
            message: session
                .failure
                .clone()
                .unwrap_or_else(|| format!("Upload ended while {state}")),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use clap::Parser;
    use musiclib_mobile_core::GateVerdict;
    use std::path::PathBuf;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: UploadArgs,
    }

    fn session(state: PipelineState) -> UploadSession {
        UploadSession {
            playlist_path: PathBuf::from("/p/Road Trip.audpl"),
            playlist_name: "Road Trip".to_string(),
            device_id: "abcd1234".to_string(),
            halt_if_newer: true,
            end_time_override: None,
            state,
            progress_current: 0,
            progress_total: 0,
            phase_label: String::new(),
            verdict: None,
            failure: None,
            deferred: false,
        }
    }

    #[test]
    fn test_parse_args() {
        let h = Harness::try_parse_from([
            "upload",
            "-p",
            "Road Trip",
            "--halt-if-newer",
            "--end-time",
            "03/14/2026 18:30:05",
        ])
        .unwrap();
        assert_eq!(h.args.playlist.as_deref(), Some("Road Trip"));
        assert!(h.args.halt_if_newer);
        assert!(h.args.device.is_none());
    }

    #[test]
    fn test_outcome_mapping() {
        assert!(outcome(&session(PipelineState::Completed)).is_ok());

        let mut halted = session(PipelineState::Halted);
        halted.verdict = Some(GateVerdict::Newer);
        let err = outcome(&halted).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("newer version of 'Road Trip'"));

        let mut deferred = session(PipelineState::Failed);
        deferred.deferred = true;
        deferred.failure = Some("Backend busy, try again later".to_string());
        assert_eq!(outcome(&deferred).unwrap_err().exit_code(), 3);

        let mut failed = session(PipelineState::Failed);
        failed.failure = Some("device unreachable".to_string());
        let err = outcome(&failed).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "device unreachable");
    }
}
