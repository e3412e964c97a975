//! Command implementations.
//!
//! Each subcommand opens one [`Session`], issues its requests, then drives
//! the event loop until every launched operation has reported back.

pub mod error;
pub mod output;

mod device;
mod maintenance;
mod playlist;
mod status;
mod upload;

use std::path::{Path, PathBuf};

use clap::Subcommand;
use musiclib_mobile_core::ConfigManager;

use crate::runtime::{LoopExit, Session};
pub use error::CommandError;
pub use output::Reporter;
pub use upload::UploadArgs;

/// Subcommands of the tool.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List playlists available for upload
    Playlists,
    /// Show the tracks of a playlist
    Preview {
        /// Playlist name or path (defaults to the current selection)
        playlist: Option<String>,
    },
    /// List devices
    Devices {
        /// Remember this device as the default upload target
        #[arg(long, value_name = "ID")]
        set_default: Option<String>,
    },
    /// Upload a playlist to a device
    Upload(UploadArgs),
    /// Retry accounting for an interrupted upload
    Retry {
        /// Playlist name (defaults to the current selection)
        playlist: Option<String>,
    },
    /// Remove stale mobile sync state
    Cleanup,
    /// Record last-played data without uploading
    UpdateLastPlayed {
        /// Playlist name (defaults to the current selection)
        playlist: Option<String>,
        /// When the previous playlist stopped playing
        #[arg(long, value_name = "MM/DD/YYYY HH:MM:SS")]
        end_time: Option<String>,
    },
    /// Import playlists from the player
    RefreshSource,
    /// Show mobile sync status
    Status,
    /// Rate a track from 0 to 5 stars
    Rate {
        /// Audio file to rate
        file: PathBuf,
        /// Number of stars
        #[arg(value_parser = clap::value_parser!(u8).range(0..=5))]
        stars: u8,
    },
}

/// State shared by all commands.
pub struct Context {
    session: Session,
    reporter: Reporter,
    config: ConfigManager,
}

impl Context {
    /// Render queued notifications.
    fn flush(&mut self) {
        let reporter = &mut self.reporter;
        self.session.flush(&mut |e| reporter.event(e));
    }

    /// Drive the event loop until every launched operation has finished.
    async fn settle(&mut self) -> Result<(), CommandError> {
        let reporter = &mut self.reporter;
        match self.session.run_until_idle(&mut |e| reporter.event(e)).await {
            LoopExit::Idle => Ok(()),
            LoopExit::Interrupted => Err(CommandError::Interrupted),
        }
    }

    /// Turn the first reported failure into an error.
    fn check_failure(&mut self) -> Result<(), CommandError> {
        match self.reporter.take_failure() {
            Some((kind, message)) => Err(CommandError::Reported { kind, message }),
            None => Ok(()),
        }
    }
}

/// Run `command`.
///
/// # Errors
///
/// Returns the command's failure, classified for the exit code.
pub async fn execute(
    command: Command,
    config_path: Option<&Path>,
    reporter: Reporter,
) -> Result<(), CommandError> {
    let config = match config_path {
        Some(path) => ConfigManager::from_path(path)?,
        None => ConfigManager::new()?,
    };
    let session = Session::open(config.config().clone());
    let mut ctx = Context {
        session,
        reporter,
        config,
    };

    match command {
        Command::Playlists => playlist::list(&mut ctx),
        Command::Preview { playlist } => playlist::preview(&mut ctx, playlist.as_deref()),
        Command::Devices { set_default } => device::list(&mut ctx, set_default).await,
        Command::Upload(args) => upload::run(&mut ctx, &args).await,
        Command::Retry { playlist } => maintenance::retry(&mut ctx, playlist.as_deref()).await,
        Command::Cleanup => maintenance::cleanup(&mut ctx).await,
        Command::UpdateLastPlayed { playlist, end_time } => {
            maintenance::update_last_played(&mut ctx, playlist.as_deref(), end_time.as_deref())
                .await
        }
        Command::RefreshSource => maintenance::refresh_source(&mut ctx).await,
        Command::Status => status::show(&mut ctx).await,
        Command::Rate { file, stars } => status::rate(&mut ctx, &file, stars).await,
    }
}
