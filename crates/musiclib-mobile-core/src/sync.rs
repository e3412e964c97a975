//! Mobile sync orchestrator.
//!
//! [`MobileSync`] owns the catalog, device registry, recovery tracker and
//! upload pipeline, and is the only place where they meet the process
//! supervisor. Every launched operation is remembered by its
//! [`OperationId`] together with what to do when it finishes; supervisor
//! events are fed back through [`MobileSync::handle_event`]. Observers follow
//! along through [`MobileSync::subscribe`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::device::{self, Device, DeviceRegistry};
use crate::error::{DeviceError, Error, ErrorKind, PipelineError, PlaylistError, Result};
use crate::pipeline::{self, PipelineState, Step, UploadPipeline, UploadRequest, UploadSession};
use crate::playlist::{self, PlaylistCatalog, PlaylistEntry, PlaylistSummary, Track};
use crate::process::{
    Invocation, OperationHandle, OperationId, OperationLauncher, OperationOutcome, OutcomeStatus,
    Slot, SupervisorEvent,
};
use crate::progress::{self, OutputLine};
use crate::recovery::{CleanupGuard, RecoveryMarker, RecoveryTracker};

/// Capacity of the observer channel.
const EVENT_CAPACITY: usize = 256;

/// Highest accepted rating.
pub const MAX_STARS: u8 = 5;

// =============================================================================
// Events
// =============================================================================

/// Maintenance operations sharing [`Slot::Maintenance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Re-run accounting for one playlist.
    Retry,
    /// Sweep stale mobile state.
    Cleanup,
    /// Record last-played data without uploading.
    UpdateLastPlayed,
    /// Import playlists from the player.
    RefreshSource,
}

impl std::fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "Retry"),
            Self::Cleanup => write!(f, "Cleanup"),
            Self::UpdateLastPlayed => write!(f, "Update last played"),
            Self::RefreshSource => write!(f, "Refresh from player"),
        }
    }
}

/// Notification published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncEvent {
    /// The device listing changed.
    DevicesChanged {
        /// Listed devices.
        devices: Vec<Device>,
        /// Device uploads will target.
        selected: Option<String>,
        /// Whether any device is reachable.
        any_reachable: bool,
    },
    /// The playlist catalog changed.
    PlaylistsChanged {
        /// Catalog entries.
        entries: Vec<PlaylistEntry>,
        /// Selected playlist.
        selected: Option<PathBuf>,
    },
    /// The upload pipeline changed state.
    StateChanged {
        /// New state.
        state: PipelineState,
        /// Playlist of the session.
        playlist: Option<String>,
    },
    /// Progress counters changed.
    Progress {
        /// Label such as `Uploading: 3/10`.
        label: String,
        /// Items done.
        current: u64,
        /// Items in total, 0 when indeterminate.
        total: u64,
    },
    /// A line of operation output that is not progress.
    Log {
        /// Slot that produced the line.
        slot: Slot,
        /// The line.
        line: String,
    },
    /// The upload halted at the staleness gate.
    Halted {
        /// Explanation for the user.
        message: String,
    },
    /// The upload session ended.
    UploadFinished {
        /// Terminal state.
        state: PipelineState,
        /// Failure diagnostic, if any.
        message: Option<String>,
        /// Whether the backend deferred the upload.
        deferred: bool,
    },
    /// A maintenance operation ended.
    MaintenanceFinished {
        /// Which operation.
        task: MaintenanceTask,
        /// Whether it succeeded.
        success: bool,
        /// Failure diagnostic, if any.
        message: Option<String>,
    },
    /// Recovery markers were rescanned.
    RecoveryChanged {
        /// Whether Retry is available.
        available: bool,
        /// Markers found.
        markers: Vec<RecoveryMarker>,
    },
    /// Mobile status text.
    Status {
        /// Text shown verbatim.
        text: String,
    },
    /// A rating write ended.
    Rated {
        /// Rated file.
        path: PathBuf,
        /// Stars written.
        stars: u8,
        /// Whether the write was queued by the backend.
        deferred: bool,
    },
    /// A failure to show to the user.
    Error {
        /// Error classification.
        kind: ErrorKind,
        /// Message for the user.
        message: String,
    },
}

impl SyncEvent {
    fn error(err: &Error) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Options for an upload request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Consult the staleness gate first.
    pub halt_if_newer: bool,
    /// Override for the end-time flag.
    pub end_time: Option<NaiveDateTime>,
}

/// A parsed playlist ready for display.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    /// The playlist.
    pub entry: PlaylistEntry,
    /// Its tracks, in order.
    pub tracks: Vec<Track>,
    /// Aggregate figures.
    pub summary: PlaylistSummary,
}

/// What to do when an operation finishes.
#[derive(Debug)]
enum Continuation {
    DeviceScan,
    Status,
    Check,
    Transfer,
    Maintenance {
        task: MaintenanceTask,
        guard: Option<CleanupGuard>,
    },
    Rating {
        path: PathBuf,
        stars: u8,
    },
}

impl Continuation {
    /// Whether output lines carry progress counters.
    const fn parses_progress(&self) -> bool {
        matches!(
            self,
            Self::Transfer
                | Self::Maintenance {
                    task: MaintenanceTask::Retry | MaintenanceTask::UpdateLastPlayed,
                    ..
                }
        )
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// The mobile sync session.
pub struct MobileSync<L: OperationLauncher> {
    launcher: L,
    config: AppConfig,
    catalog: PlaylistCatalog,
    devices: DeviceRegistry,
    recovery: RecoveryTracker,
    pipeline: UploadPipeline,
    pending: HashMap<OperationId, Continuation>,
    status_text: Option<String>,
    events: broadcast::Sender<SyncEvent>,
}

impl<L: OperationLauncher> MobileSync<L> {
    /// Create an orchestrator with empty snapshots.
    pub fn new(config: AppConfig, launcher: L) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            catalog: PlaylistCatalog::new(&config.playlists_directory),
            devices: DeviceRegistry::new(config.default_device_id.clone()),
            recovery: RecoveryTracker::new(&config.mobile_directory),
            pipeline: UploadPipeline::new(config.scripts.mobile_script.clone()),
            launcher,
            config,
            pending: HashMap::new(),
            status_text: None,
            events,
        }
    }

    /// Receive future notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Configuration in use.
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Playlist catalog snapshot.
    pub const fn catalog(&self) -> &PlaylistCatalog {
        &self.catalog
    }

    /// Device registry snapshot.
    pub const fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Recovery tracker snapshot.
    pub const fn recovery(&self) -> &RecoveryTracker {
        &self.recovery
    }

    /// Current or last upload session.
    pub const fn session(&self) -> Option<&UploadSession> {
        self.pipeline.session()
    }

    /// Pipeline state.
    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// Last status text.
    pub fn status_text(&self) -> Option<&str> {
        self.status_text.as_deref()
    }

    /// Number of operations awaiting their outcome.
    pub fn pending_operations(&self) -> usize {
        self.pending.len()
    }

    /// Whether no operation is awaiting its outcome.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn publish(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report(&self, err: &Error) {
        if err.is_quiet() {
            debug!("{}", err);
        } else {
            error!("{}", err);
        }
        self.publish(SyncEvent::error(err));
    }

    /// Launch in `slot`, dropping the request quietly if the slot is busy.
    fn launch(
        &mut self,
        slot: Slot,
        invocation: &Invocation,
        continuation: Continuation,
    ) -> Result<Option<OperationHandle>> {
        match self.launcher.launch(slot, invocation) {
            Ok(handle) => {
                self.pending.insert(handle.id, continuation);
                Ok(Some(handle))
            }
            Err(e) if e.kind() == ErrorKind::Busy => {
                debug!("Dropped duplicate {} request", slot);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Playlists
    // -------------------------------------------------------------------------

    /// Rescan the playlist directory and recovery markers.
    pub fn refresh_playlists(&mut self) -> Result<&[PlaylistEntry]> {
        self.catalog.refresh(self.recovery.mobile_dir())?;
        self.publish_playlists();
        self.rescan_recovery();
        Ok(self.catalog.entries())
    }

    /// Select a playlist by display name or path.
    pub fn select_playlist(&mut self, name_or_path: &str) -> Result<PlaylistEntry> {
        let entry = self.catalog.select(name_or_path)?.clone();
        self.publish_playlists();
        Ok(entry)
    }

    /// Parse a playlist, the selected one by default.
    pub fn preview(&self, name_or_path: Option<&str>) -> Result<Preview> {
        let entry = match name_or_path {
            Some(key) => self
                .catalog
                .entries()
                .iter()
                .find(|e| e.display_name == key || e.path == Path::new(key))
                .ok_or_else(|| PlaylistError::NotFound(key.to_string()))?,
            None => self.catalog.selected().ok_or(PlaylistError::NoneSelected)?,
        };
        let tracks = playlist::parse(&entry.path)?;
        let summary = PlaylistSummary::of(&tracks);
        Ok(Preview {
            entry: entry.clone(),
            tracks,
            summary,
        })
    }

    fn publish_playlists(&self) {
        self.publish(SyncEvent::PlaylistsChanged {
            entries: self.catalog.entries().to_vec(),
            selected: self.catalog.selected().map(|e| e.path.clone()),
        });
    }

    fn rescan_recovery(&mut self) {
        let available = self.recovery.rescan();
        self.publish(SyncEvent::RecoveryChanged {
            available,
            markers: self.recovery.markers().iter().cloned().collect(),
        });
    }

    fn selected_name(&self) -> Result<String> {
        self.catalog
            .selected()
            .map(|e| e.display_name.clone())
            .ok_or_else(|| PlaylistError::NoneSelected.into())
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Start a device listing.
    pub fn scan_devices(&mut self) -> Result<Option<OperationHandle>> {
        let invocation = device::scan_invocation(
            &self.config.device_listing,
            self.config.timeouts.quick_query(),
        );
        self.launch(Slot::DeviceScan, &invocation, Continuation::DeviceScan)
    }

    /// Choose the upload target for this session.
    pub fn select_device(&mut self, id: &str) -> Result<Device> {
        let device = self.devices.select(id)?.clone();
        self.publish_devices();
        Ok(device)
    }

    fn publish_devices(&self) {
        self.publish(SyncEvent::DevicesChanged {
            devices: self.devices.devices().to_vec(),
            selected: self.devices.selected_id().map(str::to_string),
            any_reachable: self.devices.any_reachable(),
        });
    }

    // -------------------------------------------------------------------------
    // Upload
    // -------------------------------------------------------------------------

    /// Upload the selected playlist to the selected device.
    ///
    /// Returns the handle of the first launched operation (check or transfer).
    /// `None` means the session ended without a running operation, which is
    /// reported through events.
    pub fn request_upload(&mut self, options: UploadOptions) -> Result<Option<OperationHandle>> {
        if self.launcher.is_running(Slot::Maintenance) {
            return Err(PipelineError::MaintenanceBusy.into());
        }
        let playlist = self
            .catalog
            .selected()
            .cloned()
            .ok_or(PlaylistError::NoneSelected)?;
        let device_id = self
            .devices
            .selected_id()
            .map(str::to_string)
            .ok_or(DeviceError::NoneSelected)?;

        let step = self.pipeline.request(UploadRequest {
            playlist,
            device_id,
            halt_if_newer: options.halt_if_newer,
            end_time: options.end_time,
        })?;
        Ok(self.drive(step))
    }

    /// Stop the running check or transfer.
    pub fn cancel_upload(&mut self) -> Result<()> {
        let slot = self
            .pipeline
            .state()
            .active_slot()
            .ok_or(PipelineError::NoActiveSession)?;
        if self.launcher.cancel(slot) {
            info!("Cancellation requested for {}", slot);
        }
        Ok(())
    }

    /// Carry out pipeline steps until one leaves an operation running.
    fn drive(&mut self, mut step: Step) -> Option<OperationHandle> {
        loop {
            self.publish_state();
            let next = match step {
                Step::Check(invocation) => {
                    match self.launch(Slot::CheckUpdate, &invocation, Continuation::Check) {
                        Ok(Some(handle)) => return Some(handle),
                        Ok(None) => self
                            .pipeline
                            .on_check_unavailable(&Error::operation_busy(Slot::CheckUpdate)),
                        Err(e) => self.pipeline.on_check_unavailable(&e),
                    }
                }
                Step::Transfer(invocation) => {
                    match self.launch(Slot::Upload, &invocation, Continuation::Transfer) {
                        Ok(Some(handle)) => return Some(handle),
                        Ok(None) => {
                            let err = Error::operation_busy(Slot::Upload);
                            self.pipeline.on_transfer_launch_failed(&err)
                        }
                        Err(e) => {
                            self.report(&e);
                            self.pipeline.on_transfer_launch_failed(&e)
                        }
                    }
                }
                Step::Halted(message) => {
                    info!("{}", message);
                    self.publish(SyncEvent::Halted { message });
                    self.rescan_recovery();
                    return None;
                }
                Step::Finished(state) => {
                    self.finish_upload(state);
                    return None;
                }
            };
            step = match next {
                Ok(step) => step,
                Err(e) => {
                    self.report(&e);
                    return None;
                }
            };
        }
    }

    fn publish_state(&self) {
        self.publish(SyncEvent::StateChanged {
            state: self.pipeline.state(),
            playlist: self.pipeline.session().map(|s| s.playlist_name.clone()),
        });
    }

    fn finish_upload(&mut self, state: PipelineState) {
        let (message, deferred) = self
            .pipeline
            .session()
            .map_or((None, false), |s| (s.failure.clone(), s.deferred));
        self.publish(SyncEvent::UploadFinished {
            state,
            message,
            deferred,
        });

        if state == PipelineState::Completed {
            if let Err(e) = self.refresh_playlists() {
                self.report(&e);
            }
        } else {
            self.rescan_recovery();
        }
        if let Err(e) = self.refresh_status() {
            self.report(&e);
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    fn ensure_maintenance_allowed(&self) -> Result<()> {
        let state = self.pipeline.state();
        if state.is_busy() {
            return Err(PipelineError::Busy {
                state: state.to_string(),
            }
            .into());
        }
        if self.launcher.is_running(Slot::Maintenance) {
            return Err(PipelineError::MaintenanceBusy.into());
        }
        Ok(())
    }

    fn start_maintenance(
        &mut self,
        task: MaintenanceTask,
        invocation: &Invocation,
        guard: Option<CleanupGuard>,
    ) -> Result<Option<OperationHandle>> {
        self.ensure_maintenance_allowed()?;
        info!("Starting {}", task);
        self.launch(
            Slot::Maintenance,
            invocation,
            Continuation::Maintenance { task, guard },
        )
    }

    /// Retry accounting for a playlist, the selected one by default.
    pub fn retry(&mut self, playlist_name: Option<&str>) -> Result<Option<OperationHandle>> {
        let name = match playlist_name {
            Some(n) => n.to_string(),
            None => self.selected_name()?,
        };
        let invocation = self
            .recovery
            .retry_invocation(&self.config.scripts.mobile_script, &name);
        self.start_maintenance(MaintenanceTask::Retry, &invocation, None)
    }

    /// Record last-played data for a playlist without uploading.
    pub fn update_last_played(
        &mut self,
        playlist_name: Option<&str>,
        end_time: Option<NaiveDateTime>,
    ) -> Result<Option<OperationHandle>> {
        let name = match playlist_name {
            Some(n) => n.to_string(),
            None => self.selected_name()?,
        };
        let invocation = pipeline::update_last_played_invocation(
            &self.config.scripts.mobile_script,
            &name,
            end_time,
        );
        self.start_maintenance(MaintenanceTask::UpdateLastPlayed, &invocation, None)
    }

    /// Sweep stale mobile state, preserving the selected and marked playlists.
    pub fn cleanup(&mut self) -> Result<Option<OperationHandle>> {
        self.ensure_maintenance_allowed()?;
        self.recovery.rescan();
        let selected = self
            .pipeline
            .session()
            .map(|s| s.playlist_name.clone())
            .or_else(|| self.catalog.selected().map(|e| e.display_name.clone()));
        let (invocation, guard) = self
            .recovery
            .cleanup_invocation(&self.config.scripts.mobile_script, selected.as_deref());
        self.start_maintenance(MaintenanceTask::Cleanup, &invocation, Some(guard))
    }

    /// Import playlists from the player, then rescan the catalog.
    pub fn refresh_from_source(&mut self) -> Result<Option<OperationHandle>> {
        let source = &self.config.source_playlists_directory;
        if source.is_dir() {
            info!("Importing playlists from {}", source.display());
        } else {
            warn!(
                "Player playlist directory {} is missing, the import may find nothing",
                source.display()
            );
        }
        let invocation = Invocation::script(&self.config.scripts.mobile_script)
            .arg("refresh-audacious-only")
            .flag("--non-interactive");
        self.start_maintenance(MaintenanceTask::RefreshSource, &invocation, None)
    }

    // -------------------------------------------------------------------------
    // Status and rating
    // -------------------------------------------------------------------------

    /// Query the backend's mobile status.
    pub fn refresh_status(&mut self) -> Result<Option<OperationHandle>> {
        let invocation = Invocation::script(&self.config.scripts.mobile_script)
            .arg("status")
            .captured()
            .with_timeout(self.config.timeouts.quick_query());
        match self.launch(Slot::Status, &invocation, Continuation::Status) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let text = format!(
                    "Status unavailable: {e}\nCheck that the backend scripts are installed."
                );
                self.set_status(text);
                Err(e)
            }
            other => other,
        }
    }

    /// Write a 0-5 star rating for a track.
    pub fn rate(&mut self, path: &Path, stars: u8) -> Result<Option<OperationHandle>> {
        if stars > MAX_STARS {
            return Err(PipelineError::InvalidRequest(format!(
                "rating must be between 0 and {MAX_STARS}, got {stars}"
            ))
            .into());
        }
        let invocation = Invocation::script(&self.config.scripts.rate_script)
            .arg(path.to_string_lossy())
            .arg(stars.to_string())
            .captured();
        self.launch(
            Slot::Rating,
            &invocation,
            Continuation::Rating {
                path: path.to_path_buf(),
                stars,
            },
        )
    }

    fn set_status(&mut self, text: String) {
        self.status_text = Some(text.clone());
        self.publish(SyncEvent::Status { text });
    }

    // -------------------------------------------------------------------------
    // Supervisor events
    // -------------------------------------------------------------------------

    /// Apply one supervisor event.
    pub fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Output { handle, line } => self.on_output(handle, line),
            SupervisorEvent::Finished(outcome) => self.on_finished(outcome),
        }
    }

    fn on_output(&mut self, handle: OperationHandle, line: String) {
        let Some(continuation) = self.pending.get(&handle.id) else {
            debug!("Output for unknown operation {}: {}", handle, line);
            return;
        };

        let parsed = match continuation {
            Continuation::Transfer => self.pipeline.on_output_line(&line),
            c if c.parses_progress() => progress::parse_line(&line),
            _ => OutputLine::Log,
        };
        debug!(slot = %handle.slot, ?parsed, "{}", line);

        match parsed {
            OutputLine::Progress(update) => self.publish(SyncEvent::Progress {
                label: update.label(),
                current: update.current,
                total: update.total,
            }),
            OutputLine::Log => self.publish(SyncEvent::Log {
                slot: handle.slot,
                line,
            }),
        }
    }

    fn on_finished(&mut self, outcome: OperationOutcome) {
        let Some(continuation) = self.pending.remove(&outcome.handle.id) else {
            warn!("Outcome for unknown operation {}", outcome.handle);
            return;
        };

        match continuation {
            Continuation::DeviceScan => self.on_device_scan_finished(&outcome),
            Continuation::Status => self.on_status_finished(&outcome),
            Continuation::Check => match self.pipeline.on_check_finished(&outcome) {
                Ok(step) => {
                    self.drive(step);
                }
                Err(e) => self.report(&e),
            },
            Continuation::Transfer => match self.pipeline.on_transfer_finished(&outcome) {
                Ok(step) => {
                    self.drive(step);
                }
                Err(e) => self.report(&e),
            },
            Continuation::Maintenance { task, guard } => {
                self.on_maintenance_finished(task, guard, outcome);
            }
            Continuation::Rating { path, stars } => self.on_rating_finished(path, stars, outcome),
        }
    }

    fn on_device_scan_finished(&mut self, outcome: &OperationOutcome) {
        if outcome.succeeded() {
            self.devices.apply_listing(&outcome.stdout);
        } else {
            let reason = match outcome.status() {
                OutcomeStatus::Failed { diagnostic } => diagnostic,
                _ => format!("exit code {:?}", outcome.exit_code),
            };
            self.devices.apply_failure(&reason);
            self.report(&DeviceError::ListingFailed(reason).into());
        }
        self.publish_devices();
    }

    fn on_status_finished(&mut self, outcome: &OperationOutcome) {
        let stdout = outcome.stdout.trim_end();
        let text = if !stdout.is_empty() {
            stdout.to_string()
        } else if !outcome.succeeded() {
            let mut msg = match outcome.exit_code {
                Some(code) => format!("Status script exited with code {code}"),
                None => "Status script did not finish".to_string(),
            };
            let stderr = outcome.stderr.trim();
            if !stderr.is_empty() {
                msg.push('\n');
                msg.push_str(stderr);
            }
            msg
        } else {
            "No status output returned.\nThe status script ran successfully but produced no output."
                .to_string()
        };
        self.set_status(text);
        self.rescan_recovery();
    }

    fn on_maintenance_finished(
        &mut self,
        task: MaintenanceTask,
        guard: Option<CleanupGuard>,
        outcome: OperationOutcome,
    ) {
        let result = outcome.into_result(&task.to_string());
        let success = result.is_ok();
        let message = result.as_ref().err().map(ToString::to_string);
        if let Err(e) = &result {
            self.report(e);
        } else {
            info!("{} complete", task);
        }

        if let Some(guard) = guard {
            let violations = guard.violations();
            if !violations.is_empty() {
                let list = violations
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.report(&PipelineError::CleanupViolation(list).into());
            }
        }

        self.publish(SyncEvent::MaintenanceFinished {
            task,
            success,
            message,
        });

        match task {
            MaintenanceTask::RefreshSource if success => {
                if let Err(e) = self.refresh_playlists() {
                    self.report(&e);
                }
            }
            MaintenanceTask::Retry | MaintenanceTask::RefreshSource => self.rescan_recovery(),
            MaintenanceTask::Cleanup | MaintenanceTask::UpdateLastPlayed => {
                self.rescan_recovery();
                if let Err(e) = self.refresh_status() {
                    self.report(&e);
                }
            }
        }
    }

    fn on_rating_finished(&mut self, path: PathBuf, stars: u8, outcome: OperationOutcome) {
        match outcome.into_result("rate") {
            Ok(_) => self.publish(SyncEvent::Rated {
                path,
                stars,
                deferred: false,
            }),
            Err(e) if e.kind() == ErrorKind::Deferred => {
                info!("Rating of {} queued: {}", path.display(), e);
                self.publish(SyncEvent::Rated {
                    path,
                    stars,
                    deferred: true,
                });
            }
            Err(e) => self.report(&e),
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Ask every running operation to stop. Returns how many were signalled.
    pub fn shutdown(&mut self) -> usize {
        let signalled = self.launcher.cancel_all();
        info!(
            "Shutting down with {} operation(s) pending",
            self.pending.len()
        );
        signalled
    }
}
