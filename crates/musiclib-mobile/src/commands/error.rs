//! Error reporting and exit codes for commands.

use musiclib_mobile_core::{Error, ErrorKind};
use tracing::error;

/// Failure of a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Error returned by the core library.
    #[error(transparent)]
    Core(#[from] Error),

    /// A failure already published as a notification.
    #[error("{message}")]
    Reported {
        /// Error classification.
        kind: ErrorKind,
        /// Message shown to the user.
        message: String,
    },

    /// The upload stopped at the staleness gate.
    #[error("{0}")]
    Halted(String),

    /// The user interrupted the command.
    #[error("Interrupted")]
    Interrupted,

    /// The async runtime could not be created.
    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl CommandError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => e.kind(),
            Self::Reported { kind, .. } => *kind,
            Self::Halted(_) | Self::Interrupted => ErrorKind::Rejected,
            Self::Runtime(_) => ErrorKind::Internal,
        }
    }

    /// Whether running the same command later may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_retryable(),
            Self::Reported { kind, .. } => matches!(
                kind,
                ErrorKind::Busy | ErrorKind::Deferred | ErrorKind::ExternalFailure
            ),
            Self::Halted(_) | Self::Interrupted | Self::Runtime(_) => false,
        }
    }

    /// Process exit code for this error.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Halted(_) => 4,
            Self::Interrupted => 130,
            _ => match self.kind() {
                ErrorKind::Rejected | ErrorKind::Configuration | ErrorKind::ParseFailure => 2,
                ErrorKind::Deferred => 3,
                ErrorKind::Busy => 5,
                ErrorKind::NotFound => 127,
                ErrorKind::ExternalFailure | ErrorKind::FileSystem | ErrorKind::Internal => 1,
            },
        }
    }
}

/// Structured error for `--json` output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub message: String,
    /// Error category for programmatic handling.
    pub kind: ErrorKind,
    /// Whether the command can be retried.
    pub retryable: bool,
    /// Suggested retry delay in seconds, if applicable.
    pub retry_delay_secs: Option<u64>,
    /// Exit code of the process.
    pub exit_code: u8,
}

impl From<&CommandError> for ErrorResponse {
    fn from(e: &CommandError) -> Self {
        Self {
            message: e.to_string(),
            kind: e.kind(),
            retryable: e.is_retryable(),
            retry_delay_secs: match e {
                CommandError::Core(core) => core.retry_delay_secs(),
                _ => None,
            },
            exit_code: e.exit_code(),
        }
    }
}

/// Log `e` and print it to stderr.
pub fn report(e: &CommandError, json: bool) {
    error!(
        "Command error [kind={}, retryable={}]: {}",
        e.kind(),
        e.is_retryable(),
        e
    );

    // Already shown when the notification was rendered.
    if matches!(e, CommandError::Reported { .. }) && !json {
        return;
    }

    let response = ErrorResponse::from(e);
    if json {
        match serde_json::to_string(&response) {
            Ok(line) => eprintln!("{line}"),
            Err(_) => eprintln!("{e}"),
        }
    } else if let Some(delay) = response.retry_delay_secs {
        eprintln!("error: {e} (try again in {delay}s)");
    } else {
        eprintln!("error: {e}");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use musiclib_mobile_core::{PipelineError, PlaylistError};

    #[test]
    fn test_exit_codes() {
        assert_eq!(CommandError::Halted("newer".to_string()).exit_code(), 4);
        assert_eq!(CommandError::Interrupted.exit_code(), 130);
        assert_eq!(
            CommandError::from(Error::deferred("upload", "busy")).exit_code(),
            3
        );
        assert_eq!(
            CommandError::from(Error::operation_not_found("x.sh", "/a")).exit_code(),
            127
        );
        assert_eq!(
            CommandError::from(Error::from(PlaylistError::NoneSelected)).exit_code(),
            2
        );
        assert_eq!(
            CommandError::from(Error::from(PipelineError::MaintenanceBusy)).exit_code(),
            5
        );
    }

    #[test]
    fn test_error_response() {
        let e = CommandError::from(Error::external_failure("upload", Some(1), "device gone"));
        let response = ErrorResponse::from(&e);
        assert_eq!(response.kind, ErrorKind::ExternalFailure);
        assert!(response.retryable);
        assert_eq!(response.retry_delay_secs, Some(5));
        assert_eq!(response.exit_code, 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "external_failure");
    }

    #[test]
    fn test_reported_error_keeps_kind() {
        let e = CommandError::Reported {
            kind: ErrorKind::Deferred,
            message: "queued".to_string(),
        };
        assert!(e.is_retryable());
        assert_eq!(e.exit_code(), 3);
        assert_eq!(e.to_string(), "queued");
    }
}
