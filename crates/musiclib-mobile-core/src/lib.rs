//! MusicLib Mobile Core Library
//!
//! This crate drives the mobile side of MusicLib: pushing a playlist to a
//! phone through the `musiclib_mobile.sh` backend and keeping the local view of
//! that process consistent.
//! - Process supervision with one running operation per slot
//! - Progress parsing of backend output
//! - Playlist catalog over `.audpl`, `.m3u`, `.m3u8` and `.pls` files
//! - Device discovery through the device listing tool
//! - Staleness gate and upload pipeline
//! - Recovery markers and the cleanup guard
//! - Configuration, including the `musiclib.conf` overlay
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`], whose [`Error`] classifies
//! itself through [`Error::kind`]. See the [`error`] module for details.
//!
//! ```rust,ignore
//! use musiclib_mobile_core::{AppConfig, MobileSync, Supervisor};
//!
//! let config = AppConfig::load()?;
//! let (supervisor, mut events) = Supervisor::from_config(&config);
//! let mut sync = MobileSync::new(config, supervisor);
//! sync.refresh_playlists()?;
//! sync.scan_devices()?;
//! while let Some(event) = events.recv().await {
//!     sync.handle_event(event);
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod playlist;
pub mod process;
pub mod progress;
pub mod recovery;
pub mod sync;

pub use config::{
    AppConfig, ConfigManager, DeviceListingConfig, ScriptConfig, TimeoutConfig,
    locate_shell_conf, parse_shell_conf, read_shell_conf,
};
pub use device::{Device, DeviceRegistry, parse_device_line, parse_device_list};
pub use error::{
    DeviceError, Error, ErrorKind, FileSystemError, PipelineError, PlaylistError, ProcessError,
    Result,
};
pub use gate::GateVerdict;
pub use pipeline::{
    END_TIME_FORMAT, PipelineState, Step, UploadPipeline, UploadRequest, UploadSession,
    parse_end_time,
};
pub use playlist::{
    CURRENT_PLAYLIST_FILE, PlaylistCatalog, PlaylistEntry, PlaylistFormat, PlaylistSummary, Track,
};
pub use process::{
    EXIT_DEFERRED, Invocation, OperationHandle, OperationId, OperationLauncher, OperationOutcome,
    OutcomeStatus, OutputMode, Program, ScriptLocator, Slot, Supervisor, SupervisorEvent,
    SupervisorEvents, Termination,
};
pub use progress::{OutputLine, ProgressPhase, ProgressUpdate, parse_line};
pub use recovery::{CleanupGuard, MarkerKind, RecoveryMarker, RecoveryTracker};
pub use sync::{MAX_STARS, MaintenanceTask, MobileSync, Preview, SyncEvent, UploadOptions};
