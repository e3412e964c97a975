//! `musiclib-mobile`: push MusicLib playlists to a phone from the terminal.

mod commands;
mod logging;
mod runtime;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::{debug, info};

use crate::commands::{Command, CommandError, Reporter};
use crate::logging::LoggingConfig;

/// Sync MusicLib playlists to a mobile device.
#[derive(Debug, Parser)]
#[command(name = "musiclib-mobile", version, about)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Do not write log files
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::for_verbosity(cli.verbose);
    if cli.no_log_file {
        logging = logging.without_file();
    }
    let _guard = logging::init(&logging)
        .or_else(|e| {
            eprintln!("warning: {e}, logging to stderr only");
            logging::init(&logging.clone().without_file())
        })
        .ok();

    info!("musiclib-mobile v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command: {:?}", cli.command);

    let json = cli.json;
    let reporter = Reporter::new(json);
    let result = runtime::build()
        .map_err(CommandError::from)
        .and_then(|rt| {
            rt.block_on(commands::execute(
                cli.command,
                cli.config.as_deref(),
                reporter,
            ))
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            commands::error::report(&e, json);
            ExitCode::from(e.exit_code())
        }
    }
}
