//! Upload pipeline state machine.
//!
//! ```text
//! Idle --request(halt_if_newer)--> CheckingUpdate --clear--> Uploading
//!                                   |                         |
//!                                   +--newer/new--> Halted    +--exit 0--> Completed
//! Idle --request(!halt_if_newer)-----------------> Uploading  +--exit≠0--> Failed
//! ```
//!
//! The pipeline never runs anything itself. Each transition returns a [`Step`]
//! telling the caller which operation to launch next, which keeps the state
//! machine testable without processes.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, PipelineError, Result};
use crate::gate::{self, GateVerdict};
use crate::playlist::PlaylistEntry;
use crate::process::{Invocation, OperationOutcome, OutcomeStatus, Slot};
use crate::progress::{self, OutputLine, ProgressUpdate};

/// Format of the `--end-time` flag.
pub const END_TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No session.
    #[default]
    Idle,
    /// Waiting for the staleness check.
    CheckingUpdate,
    /// Stopped because the source has a newer playlist.
    Halted,
    /// Transfer running.
    Uploading,
    /// Transfer succeeded.
    Completed,
    /// Transfer failed or could not start.
    Failed,
}

impl PipelineState {
    /// Whether a session in this state blocks new requests.
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::CheckingUpdate | Self::Uploading)
    }

    /// Whether the session has ended.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Halted | Self::Completed | Self::Failed)
    }

    /// Slot of the operation this state is waiting on.
    pub const fn active_slot(self) -> Option<Slot> {
        match self {
            Self::CheckingUpdate => Some(Slot::CheckUpdate),
            Self::Uploading => Some(Slot::Upload),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::CheckingUpdate => write!(f, "Checking for updates"),
            Self::Halted => write!(f, "Halted"),
            Self::Uploading => write!(f, "Uploading"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A request to upload one playlist to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Playlist to upload.
    pub playlist: PlaylistEntry,
    /// Target device id.
    pub device_id: String,
    /// Consult the staleness gate first.
    pub halt_if_newer: bool,
    /// Override for when the previous playlist stopped playing.
    pub end_time: Option<NaiveDateTime>,
}

/// State of the current or last upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSession {
    /// Playlist file.
    pub playlist_path: PathBuf,
    /// Playlist display name.
    pub playlist_name: String,
    /// Target device id.
    pub device_id: String,
    /// Whether the gate was requested.
    pub halt_if_newer: bool,
    /// End-time override passed to the backend.
    pub end_time_override: Option<NaiveDateTime>,
    /// Current state.
    pub state: PipelineState,
    /// Items done in the current phase.
    pub progress_current: u64,
    /// Items in the current phase, 0 when indeterminate.
    pub progress_total: u64,
    /// Label describing the current phase.
    pub phase_label: String,
    /// Gate verdict, once known.
    pub verdict: Option<GateVerdict>,
    /// Failure diagnostic for the `Failed` state.
    pub failure: Option<String>,
    /// Whether the backend asked to try again later (exit code 3).
    pub deferred: bool,
}

impl UploadSession {
    fn new(request: &UploadRequest) -> Self {
        Self {
            playlist_path: request.playlist.path.clone(),
            playlist_name: request.playlist.display_name.clone(),
            device_id: request.device_id.clone(),
            halt_if_newer: request.halt_if_newer,
            end_time_override: request.end_time,
            state: PipelineState::Idle,
            progress_current: 0,
            progress_total: 0,
            phase_label: String::new(),
            verdict: None,
            failure: None,
            deferred: false,
        }
    }

    fn apply(&mut self, update: &ProgressUpdate) {
        self.progress_current = update.current;
        self.progress_total = update.total;
        self.phase_label = update.label();
    }
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Launch the staleness check in [`Slot::CheckUpdate`].
    Check(Invocation),
    /// Launch the transfer in [`Slot::Upload`].
    Transfer(Invocation),
    /// The session halted; show the message.
    Halted(String),
    /// The session reached a terminal state.
    Finished(PipelineState),
}

/// Transfer invocation: `upload <playlist> <device> --non-interactive [--end-time <ts>]`.
pub fn upload_invocation(
    script: &str,
    playlist: &std::path::Path,
    device_id: &str,
    end_time: Option<NaiveDateTime>,
) -> Invocation {
    let inv = Invocation::script(script)
        .arg("upload")
        .arg(playlist.to_string_lossy())
        .arg(device_id)
        .flag("--non-interactive");
    with_end_time(inv, end_time)
}

/// Manual accounting: `update-lastplayed <name> --non-interactive [--end-time <ts>]`.
pub fn update_last_played_invocation(
    script: &str,
    playlist_name: &str,
    end_time: Option<NaiveDateTime>,
) -> Invocation {
    let inv = Invocation::script(script)
        .arg("update-lastplayed")
        .arg(playlist_name)
        .flag("--non-interactive");
    with_end_time(inv, end_time)
}

fn with_end_time(inv: Invocation, end_time: Option<NaiveDateTime>) -> Invocation {
    match end_time {
        Some(ts) => inv.flag_value("--end-time", ts.format(END_TIME_FORMAT).to_string()),
        None => inv,
    }
}

/// Parse a user-supplied end time in [`END_TIME_FORMAT`].
pub fn parse_end_time(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), END_TIME_FORMAT).map_err(|e| {
        Error::Configuration(format!(
            "Invalid end time '{value}', expected MM/DD/YYYY HH:MM:SS: {e}"
        ))
    })
}

/// Drives one upload session at a time.
#[derive(Debug, Clone)]
pub struct UploadPipeline {
    script: String,
    session: Option<UploadSession>,
}

impl UploadPipeline {
    /// Create an idle pipeline that runs `script`.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            session: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.session.as_ref().map_or(PipelineState::Idle, |s| s.state)
    }

    /// Current or last session.
    pub const fn session(&self) -> Option<&UploadSession> {
        self.session.as_ref()
    }

    /// Start a new session.
    ///
    /// Rejected while another session is checking or uploading. A terminal
    /// session is replaced.
    pub fn request(&mut self, request: UploadRequest) -> Result<Step> {
        let state = self.state();
        if state.is_busy() {
            debug!("Rejecting upload request while {}", state);
            return Err(PipelineError::Busy {
                state: state.to_string(),
            }
            .into());
        }
        request.playlist.ensure_uploadable()?;

        let mut session = UploadSession::new(&request);
        let step = if request.halt_if_newer {
            session.state = PipelineState::CheckingUpdate;
            session.phase_label = "Checking for updates...".to_string();
            info!("Checking '{}' for newer source before upload", session.playlist_name);
            Step::Check(gate::check_invocation(&self.script, &session.playlist_name))
        } else {
            begin_transfer(&self.script, &mut session)
        };
        self.session = Some(session);
        Ok(step)
    }

    fn active(&mut self, expected: PipelineState) -> Result<&mut UploadSession> {
        active(&mut self.session, expected)
    }

    /// Apply the staleness check's outcome.
    pub fn on_check_finished(&mut self, outcome: &OperationOutcome) -> Result<Step> {
        self.on_gate_verdict(gate::interpret(outcome))
    }

    /// Apply a gate verdict.
    pub fn on_gate_verdict(&mut self, verdict: GateVerdict) -> Result<Step> {
        let session = active(&mut self.session, PipelineState::CheckingUpdate)?;
        session.verdict = Some(verdict);

        if let Some(message) = verdict.halt_message(&session.playlist_name) {
            info!("Upload halted: source playlist is {}", verdict);
            session.state = PipelineState::Halted;
            session.phase_label = "Halted".to_string();
            return Ok(Step::Halted(message));
        }

        Ok(begin_transfer(&self.script, session))
    }

    /// The check could not be started; proceed as if it were clear.
    pub fn on_check_unavailable(&mut self, err: &Error) -> Result<Step> {
        warn!("Staleness check unavailable, proceeding: {}", err);
        self.on_gate_verdict(GateVerdict::Clear)
    }

    /// The transfer could not be started.
    pub fn on_transfer_launch_failed(&mut self, err: &Error) -> Result<Step> {
        let session = self.active(PipelineState::Uploading)?;
        session.state = PipelineState::Failed;
        session.failure = Some(err.to_string());
        session.phase_label = "Failed".to_string();
        warn!("Upload could not start: {}", err);
        Ok(Step::Finished(PipelineState::Failed))
    }

    /// Classify a transfer output line, updating progress while uploading.
    pub fn on_output_line(&mut self, line: &str) -> OutputLine {
        let parsed = progress::parse_line(line);
        if let OutputLine::Progress(update) = &parsed
            && let Some(session) = self.session.as_mut()
            && session.state == PipelineState::Uploading
        {
            session.apply(update);
        }
        parsed
    }

    /// Apply the transfer's terminal outcome.
    pub fn on_transfer_finished(&mut self, outcome: &OperationOutcome) -> Result<Step> {
        let session = self.active(PipelineState::Uploading)?;
        match outcome.status() {
            OutcomeStatus::Success => {
                session.state = PipelineState::Completed;
                session.phase_label = "Upload complete".to_string();
                if session.progress_total > 0 {
                    session.progress_current = session.progress_total;
                }
                info!("Upload of '{}' completed", session.playlist_name);
            }
            OutcomeStatus::Deferred => {
                session.state = PipelineState::Failed;
                session.deferred = true;
                session.failure = Some("Backend busy, try again later".to_string());
                session.phase_label = "Deferred".to_string();
                info!("Upload of '{}' deferred by backend", session.playlist_name);
            }
            OutcomeStatus::Failed { diagnostic } => {
                session.state = PipelineState::Failed;
                session.phase_label = "Failed".to_string();
                warn!("Upload of '{}' failed: {}", session.playlist_name, diagnostic);
                session.failure = Some(diagnostic);
            }
        }
        Ok(Step::Finished(session.state))
    }
}

fn active(
    session: &mut Option<UploadSession>,
    expected: PipelineState,
) -> Result<&mut UploadSession> {
    match session.as_mut() {
        Some(s) if s.state == expected => Ok(s),
        _ => Err(PipelineError::NoActiveSession.into()),
    }
}

fn begin_transfer(script: &str, session: &mut UploadSession) -> Step {
    session.state = PipelineState::Uploading;
    session.progress_current = 0;
    session.progress_total = 0;
    session.phase_label = "Starting upload...".to_string();
    info!(
        "Uploading '{}' to device {}",
        session.playlist_name, session.device_id
    );
    Step::Transfer(upload_invocation(
        script,
        &session.playlist_path,
        &session.device_id,
        session.end_time_override,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::{OperationHandle, OperationId, Termination};
    use std::path::Path;

    const SCRIPT: &str = "musiclib_mobile.sh";

    fn request(halt_if_newer: bool) -> UploadRequest {
        UploadRequest {
            playlist: PlaylistEntry::from_path(Path::new("/p/Road Trip.audpl")).unwrap(),
            device_id: "abcd1234".to_string(),
            halt_if_newer,
            end_time: None,
        }
    }

    fn finished(slot: Slot, code: i32, stdout: &str, stderr: &str) -> OperationOutcome {
        OperationOutcome {
            handle: OperationHandle {
                id: OperationId(1),
                slot,
            },
            exit_code: Some(code),
            termination: Termination::Exited,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_halt_if_newer_runs_check_first() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        let step = pipeline.request(request(true)).unwrap();
        let Step::Check(inv) = step else {
            panic!("expected check, got {step:?}");
        };
        assert_eq!(
            inv.command_line().collect::<Vec<_>>(),
            vec!["check-update", "Road Trip"]
        );
        assert_eq!(pipeline.state(), PipelineState::CheckingUpdate);
    }

    #[test]
    fn test_newer_source_halts_without_transfer() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(true)).unwrap();
        let step = pipeline
            .on_check_finished(&finished(Slot::CheckUpdate, 0, "STATUS:newer\n", ""))
            .unwrap();
        assert!(matches!(step, Step::Halted(_)));
        assert_eq!(pipeline.state(), PipelineState::Halted);
        assert_eq!(pipeline.session().unwrap().verdict, Some(GateVerdict::Newer));
    }

    #[test]
    fn test_clear_gate_starts_transfer() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(true)).unwrap();
        let step = pipeline
            .on_check_finished(&finished(Slot::CheckUpdate, 1, "STATUS:same\n", ""))
            .unwrap();
        let Step::Transfer(inv) = step else {
            panic!("expected transfer, got {step:?}");
        };
        assert_eq!(
            inv.command_line().collect::<Vec<_>>(),
            vec!["upload", "/p/Road Trip.audpl", "abcd1234", "--non-interactive"]
        );
        assert_eq!(pipeline.state(), PipelineState::Uploading);
    }

    #[test]
    fn test_bypass_goes_straight_to_uploading() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        let step = pipeline.request(request(false)).unwrap();
        assert!(matches!(step, Step::Transfer(_)));
        assert_eq!(pipeline.state(), PipelineState::Uploading);
    }

    #[test]
    fn test_second_request_while_busy_is_rejected() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(false)).unwrap();
        let err = pipeline.request(request(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(pipeline.state(), PipelineState::Uploading);
    }

    #[test]
    fn test_terminal_state_accepts_new_request() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(true)).unwrap();
        pipeline.on_gate_verdict(GateVerdict::New).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Halted);

        let step = pipeline.request(request(false)).unwrap();
        assert!(matches!(step, Step::Transfer(_)));
        assert!(pipeline.session().unwrap().verdict.is_none());
    }

    #[test]
    fn test_non_audpl_is_rejected() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        let mut req = request(false);
        req.playlist = PlaylistEntry::from_path(Path::new("/p/mix.m3u")).unwrap();
        let err = pipeline.request(req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_progress_lines_update_session() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(false)).unwrap();

        pipeline.on_output_line("ACCOUNTING: Track 2/5: a.mp3");
        assert_eq!(pipeline.session().unwrap().phase_label, "Accounting: 2/5");

        pipeline.on_output_line("UPLOAD: [3/10] track.mp3");
        let session = pipeline.session().unwrap();
        assert_eq!(session.progress_current, 3);
        assert_eq!(session.progress_total, 10);
        assert_eq!(session.phase_label, "Uploading: 3/10");

        assert_eq!(pipeline.on_output_line("copying..."), OutputLine::Log);
        assert_eq!(pipeline.session().unwrap().progress_current, 3);
    }

    #[test]
    fn test_progress_ignored_outside_uploading() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(true)).unwrap();
        pipeline.on_output_line("UPLOAD: [3/10] track.mp3");
        assert_eq!(pipeline.session().unwrap().progress_total, 0);
    }

    #[test]
    fn test_transfer_success_completes() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(false)).unwrap();
        pipeline.on_output_line("UPLOAD: [9/10] x");
        let step = pipeline
            .on_transfer_finished(&finished(Slot::Upload, 0, "", ""))
            .unwrap();
        assert_eq!(step, Step::Finished(PipelineState::Completed));
        assert_eq!(pipeline.session().unwrap().progress_current, 10);
    }

    #[test]
    fn test_transfer_failure_keeps_diagnostic() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(false)).unwrap();
        let step = pipeline
            .on_transfer_finished(&finished(Slot::Upload, 1, "", "device unreachable\n"))
            .unwrap();
        assert_eq!(step, Step::Finished(PipelineState::Failed));
        let session = pipeline.session().unwrap();
        assert_eq!(session.failure.as_deref(), Some("device unreachable"));
        assert!(!session.deferred);
    }

    #[test]
    fn test_transfer_exit_3_is_deferred_failure() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(false)).unwrap();
        pipeline
            .on_transfer_finished(&finished(Slot::Upload, 3, "", ""))
            .unwrap();
        let session = pipeline.session().unwrap();
        assert_eq!(session.state, PipelineState::Failed);
        assert!(session.deferred);
    }

    #[test]
    fn test_check_unavailable_proceeds_to_transfer() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        pipeline.request(request(true)).unwrap();
        let err = Error::operation_not_found(SCRIPT, "/a or /b");
        let step = pipeline.on_check_unavailable(&err).unwrap();
        assert!(matches!(step, Step::Transfer(_)));

        let step = pipeline.on_transfer_launch_failed(&err).unwrap();
        assert_eq!(step, Step::Finished(PipelineState::Failed));
    }

    #[test]
    fn test_out_of_order_events_are_rejected() {
        let mut pipeline = UploadPipeline::new(SCRIPT);
        assert!(pipeline.on_gate_verdict(GateVerdict::Clear).is_err());
        assert!(
            pipeline
                .on_transfer_finished(&finished(Slot::Upload, 0, "", ""))
                .is_err()
        );
    }

    #[test]
    fn test_end_time_flag() {
        let ts = parse_end_time("03/14/2026 18:30:05").unwrap();
        let inv = upload_invocation(SCRIPT, Path::new("/p/a.audpl"), "dev", Some(ts));
        let args: Vec<_> = inv.command_line().collect();
        assert_eq!(&args[3..], &["--non-interactive", "--end-time", "03/14/2026 18:30:05"]);

        assert!(parse_end_time("2026-03-14").is_err());
    }

    #[test]
    fn test_update_last_played_invocation() {
        let inv = update_last_played_invocation(SCRIPT, "Road Trip", None);
        assert_eq!(
            inv.command_line().collect::<Vec<_>>(),
            vec!["update-lastplayed", "Road Trip", "--non-interactive"]
        );
    }
}
