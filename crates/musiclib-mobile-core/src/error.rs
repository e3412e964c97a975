//! Error types for mobile sync operations.
//!
//! Errors are grouped by the component that raises them. [`Error::kind`]
//! collapses them into the small [`ErrorKind`] taxonomy the front end uses to
//! decide how loudly to report a failure.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An executable or file could not be located.
    NotFound,
    /// The same-named operation is already running.
    Busy,
    /// An external operation exited with a failure code.
    ExternalFailure,
    /// An external operation asked to be retried later (exit code 3).
    Deferred,
    /// A line did not match its grammar.
    ParseFailure,
    /// A request was refused before anything was started.
    Rejected,
    /// Local filesystem access failed.
    FileSystem,
    /// Configuration is missing or malformed.
    Configuration,
    /// Unexpected internal condition.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::ExternalFailure => "external_failure",
            Self::Deferred => "deferred",
            Self::ParseFailure => "parse_failure",
            Self::Rejected => "rejected",
            Self::FileSystem => "file_system",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The script could not be found in any search location.
    #[error("{script} not found in {searched}")]
    NotFound {
        /// Script file name.
        script: String,
        /// Human-readable list of the searched directories.
        searched: String,
    },

    /// An operation is already running in the requested slot.
    #[error("Operation '{slot}' is already running")]
    Busy {
        /// Slot name.
        slot: String,
    },

    /// The operating system refused to start the process.
    #[error("Failed to start {program}: {reason}")]
    SpawnFailed {
        /// Program that was started.
        program: String,
        /// Reason for the failure.
        reason: String,
    },

    /// The operation exited with a failure code.
    #[error("{operation} failed: {diagnostic}")]
    Failed {
        /// Operation name.
        operation: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Diagnostic text (stderr or a synthesized message).
        diagnostic: String,
    },

    /// The operation asked to be retried later.
    #[error("{operation} deferred: {message}")]
    Deferred {
        /// Operation name.
        operation: String,
        /// Explanation shown to the user.
        message: String,
    },
}

/// Errors raised while cataloging or parsing playlists.
#[derive(Debug, Error)]
pub enum PlaylistError {
    /// The file extension is not a supported playlist format.
    #[error("Unsupported playlist format: {path}")]
    UnsupportedFormat {
        /// Offending path.
        path: PathBuf,
    },

    /// The playlist format cannot be uploaded.
    #[error("Upload not yet supported for .{format} playlists ({name})")]
    UploadNotSupported {
        /// Playlist display name.
        name: String,
        /// Format extension.
        format: String,
    },

    /// The playlist is not in the current catalog.
    #[error("Playlist not found: {0}")]
    NotFound(String),

    /// No playlist has been selected.
    #[error("No playlist selected")]
    NoneSelected,

    /// A playlist line failed to parse.
    #[error("{path}:{line}: {reason}")]
    ParseFailure {
        /// Playlist path.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Why the line was rejected.
        reason: String,
    },
}

/// Errors raised by the device registry.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device has been selected or can be defaulted.
    #[error("No device selected")]
    NoneSelected,

    /// The requested device id is not in the current listing.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device listing command failed.
    #[error("Device listing failed: {0}")]
    ListingFailed(String),

    /// A listing line did not match the device grammar.
    #[error("Unrecognized device line: {0}")]
    ParseFailure(String),
}

/// Errors raised by the upload pipeline and maintenance requests.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A session is already checking or uploading.
    #[error("An upload is already in progress ({state})")]
    Busy {
        /// Current pipeline state.
        state: String,
    },

    /// A maintenance operation is already running.
    #[error("Another maintenance operation is running")]
    MaintenanceBusy,

    /// There is no active session to act on.
    #[error("No upload in progress")]
    NoActiveSession,

    /// Cleanup removed state it was supposed to preserve.
    #[error("Cleanup removed protected state: {0}")]
    CleanupViolation(String),

    /// The request arguments are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors for local filesystem access.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading a file or directory failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },

    /// Writing a file failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory path.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },

    /// The path does not exist.
    #[error("Path not found: {0}")]
    NotFound(PathBuf),
}

/// Errors that can occur in mobile sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// External process supervision error.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Playlist catalog error.
    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    /// Device registry error.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Upload pipeline error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// File system error.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Script could not be located in any search directory.
    pub fn operation_not_found(script: impl Into<String>, searched: impl Into<String>) -> Self {
        Self::Process(ProcessError::NotFound {
            script: script.into(),
            searched: searched.into(),
        })
    }

    /// Slot is occupied by a running operation.
    pub fn operation_busy(slot: impl std::fmt::Display) -> Self {
        Self::Process(ProcessError::Busy {
            slot: slot.to_string(),
        })
    }

    /// Operation exited with a failure.
    pub fn external_failure(
        operation: impl Into<String>,
        code: Option<i32>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self::Process(ProcessError::Failed {
            operation: operation.into(),
            code,
            diagnostic: diagnostic.into(),
        })
    }

    /// Operation was deferred by the backend.
    pub fn deferred(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process(ProcessError::Deferred {
            operation: operation.into(),
            message: message.into(),
        })
    }

    /// Reading `path` failed.
    pub fn read_failed(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::FileSystem(FileSystemError::ReadFailed {
            path: path.into(),
            reason: err.to_string(),
        })
    }

    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Process(e) => match e {
                ProcessError::NotFound { .. } => ErrorKind::NotFound,
                ProcessError::Busy { .. } => ErrorKind::Busy,
                ProcessError::SpawnFailed { .. } | ProcessError::Failed { .. } => {
                    ErrorKind::ExternalFailure
                }
                ProcessError::Deferred { .. } => ErrorKind::Deferred,
            },
            Self::Playlist(e) => match e {
                PlaylistError::NotFound(_) => ErrorKind::NotFound,
                PlaylistError::ParseFailure { .. } => ErrorKind::ParseFailure,
                PlaylistError::UnsupportedFormat { .. }
                | PlaylistError::UploadNotSupported { .. }
                | PlaylistError::NoneSelected => ErrorKind::Rejected,
            },
            Self::Device(e) => match e {
                DeviceError::NotFound(_) => ErrorKind::NotFound,
                DeviceError::ParseFailure(_) => ErrorKind::ParseFailure,
                DeviceError::ListingFailed(_) => ErrorKind::ExternalFailure,
                DeviceError::NoneSelected => ErrorKind::Rejected,
            },
            Self::Pipeline(e) => match e {
                PipelineError::Busy { .. } | PipelineError::MaintenanceBusy => ErrorKind::Busy,
                PipelineError::NoActiveSession | PipelineError::InvalidRequest(_) => {
                    ErrorKind::Rejected
                }
                PipelineError::CleanupViolation(_) => ErrorKind::ExternalFailure,
            },
            Self::FileSystem(FileSystemError::NotFound(_)) => ErrorKind::NotFound,
            Self::FileSystem(_) | Self::Io(_) => ErrorKind::FileSystem,
            Self::Configuration(_) | Self::Serialization(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether trying the same request again later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Busy | ErrorKind::Deferred | ErrorKind::ExternalFailure
        )
    }

    /// Suggested wait before a user-initiated retry.
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self.kind() {
            ErrorKind::Busy => Some(2),
            ErrorKind::Deferred => Some(30),
            ErrorKind::ExternalFailure => Some(5),
            _ => None,
        }
    }

    /// Whether this error should be reported quietly.
    ///
    /// Busy rejections are expected when a user double-clicks and deferrals
    /// are soft outcomes.
    pub const fn is_quiet(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Deferred)
    }
}
