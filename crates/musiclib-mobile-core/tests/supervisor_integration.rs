//! Integration tests for process supervision and the sync orchestrator.
//!
//! These tests run real `bash` scripts from a temporary script directory, so
//! they exercise spawning, output streaming, cancellation and timeouts end to
//! end.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use musiclib_mobile_core::{
    AppConfig, ErrorKind, Invocation, MobileSync, OperationLauncher, OutcomeStatus,
    PipelineState, ScriptLocator, Slot, Supervisor, SupervisorEvent, SupervisorEvents,
    SyncEvent, Termination, UploadOptions,
};
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct TestFixture {
    scripts: TempDir,
    playlists: TempDir,
    mobile: TempDir,
}

impl TestFixture {
    fn new() -> Self {
        Self {
            scripts: TempDir::new().unwrap(),
            playlists: TempDir::new().unwrap(),
            mobile: TempDir::new().unwrap(),
        }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.scripts.path().join(name);
        fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
        path
    }

    fn supervisor(&self) -> (Supervisor, SupervisorEvents) {
        let locator = ScriptLocator::new(
            vec![
                self.scripts.path().to_path_buf(),
                PathBuf::from("/nonexistent/musiclib/bin"),
            ],
            "bash",
        );
        Supervisor::new(locator, Duration::from_millis(500))
    }

    fn config(&self) -> AppConfig {
        let mut config = AppConfig {
            playlists_directory: self.playlists.path().to_path_buf(),
            mobile_directory: self.mobile.path().to_path_buf(),
            ..Default::default()
        };
        config.scripts.development_directory = self.scripts.path().to_path_buf();
        config.scripts.installed_directory = PathBuf::from("/nonexistent/musiclib/bin");
        config.device_listing.program = "echo".to_string();
        config.device_listing.args = vec!["- Phone: abcd1234 (paired and reachable)".to_string()];
        config
    }
}

async fn next_event(rx: &mut SupervisorEvents) -> SupervisorEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("supervisor event in time")
        .expect("channel open")
}

/// Collect output lines until the operation finishes.
async fn run_to_end(rx: &mut SupervisorEvents) -> (Vec<String>, SupervisorEvent) {
    let mut lines = Vec::new();
    loop {
        match next_event(rx).await {
            SupervisorEvent::Output { line, .. } => lines.push(line),
            finished @ SupervisorEvent::Finished(_) => return (lines, finished),
        }
    }
}

fn write_playlist(dir: &Path, name: &str) {
    fs::write(dir.join(name), "uri=file:///music/a.mp3\nuri=file:///music/b.mp3\n").unwrap();
}

#[tokio::test]
async fn test_streamed_lines_arrive_in_order_before_finished() {
    let fixture = TestFixture::new();
    fixture.script(
        "musiclib_mobile.sh",
        "echo 'UPLOAD: [1/3] a.mp3'\necho 'UPLOAD: [2/3] b.mp3'\necho 'UPLOAD: [3/3] c.mp3'",
    );
    let (mut supervisor, mut rx) = fixture.supervisor();

    let handle = supervisor
        .launch(Slot::Upload, &Invocation::script("musiclib_mobile.sh"))
        .unwrap();
    let (lines, finished) = run_to_end(&mut rx).await;

    assert_eq!(
        lines,
        vec!["UPLOAD: [1/3] a.mp3", "UPLOAD: [2/3] b.mp3", "UPLOAD: [3/3] c.mp3"]
    );
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };
    assert_eq!(outcome.handle, handle);
    assert!(outcome.succeeded());
    assert!(!supervisor.is_running(Slot::Upload));
}

#[tokio::test]
async fn test_exit_is_reported_while_background_child_holds_output() {
    let fixture = TestFixture::new();
    fixture.script(
        "musiclib_mobile.sh",
        "echo 'UPLOAD: [1/1] a.mp3'\nsleep 20 &\necho 'handed off'\nexit 0",
    );
    let (mut supervisor, mut rx) = fixture.supervisor();

    let started = std::time::Instant::now();
    supervisor
        .launch(Slot::Upload, &Invocation::script("musiclib_mobile.sh"))
        .unwrap();
    let (lines, finished) = run_to_end(&mut rx).await;

    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(lines, vec!["UPLOAD: [1/1] a.mp3", "handed off"]);
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };
    assert_eq!(outcome.termination, Termination::Exited);
    assert_eq!(outcome.exit_code, Some(0));
}

#[tokio::test]
async fn test_exit_code_3_is_deferred() {
    let fixture = TestFixture::new();
    fixture.script("musiclib_rate.sh", "echo 'queued' >&2\nexit 3");
    let (mut supervisor, mut rx) = fixture.supervisor();

    supervisor
        .launch(
            Slot::Rating,
            &Invocation::script("musiclib_rate.sh").arg("/music/a.mp3").arg("4").captured(),
        )
        .unwrap();
    let (_, finished) = run_to_end(&mut rx).await;
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };

    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.status(), OutcomeStatus::Deferred);
    let err = outcome.into_result("rate").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deferred);
    assert!(err.to_string().contains("queued"));
}

#[tokio::test]
async fn test_captured_output_and_stderr_diagnostic() {
    let fixture = TestFixture::new();
    fixture.script("musiclib_mobile.sh", "echo \"args: $*\"\necho 'device gone' >&2\nexit 1");
    let (mut supervisor, mut rx) = fixture.supervisor();

    supervisor
        .launch(
            Slot::Status,
            &Invocation::script("musiclib_mobile.sh").arg("status").captured(),
        )
        .unwrap();
    let (lines, finished) = run_to_end(&mut rx).await;
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };

    assert!(lines.is_empty());
    assert_eq!(outcome.stdout.trim(), "args: status");
    assert_eq!(
        outcome.status(),
        OutcomeStatus::Failed {
            diagnostic: "device gone".to_string()
        }
    );
}

#[tokio::test]
async fn test_second_launch_in_busy_slot_is_rejected() {
    let fixture = TestFixture::new();
    fixture.script("slow.sh", "exec sleep 30");
    let (mut supervisor, mut rx) = fixture.supervisor();

    let first = supervisor
        .launch(Slot::Maintenance, &Invocation::script("slow.sh"))
        .unwrap();
    let err = supervisor
        .launch(Slot::Maintenance, &Invocation::script("slow.sh"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(supervisor.running().len(), 1);

    // Other slots are independent.
    fixture.script("quick.sh", "true");
    supervisor
        .launch(Slot::Status, &Invocation::script("quick.sh"))
        .unwrap();

    assert!(supervisor.cancel(Slot::Maintenance));
    let mut finished = Vec::new();
    while finished.len() < 2 {
        if let SupervisorEvent::Finished(outcome) = next_event(&mut rx).await {
            finished.push(outcome);
        }
    }
    let maintenance: Vec<_> = finished
        .iter()
        .filter(|o| o.handle.slot == Slot::Maintenance)
        .collect();
    assert_eq!(maintenance.len(), 1);
    assert_eq!(maintenance[0].handle, first);

    // No second outcome for the rejected launch.
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_missing_script_is_not_found() {
    let fixture = TestFixture::new();
    let (mut supervisor, _rx) = fixture.supervisor();

    let err = supervisor
        .launch(Slot::Status, &Invocation::script("musiclib_mobile.sh"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let message = err.to_string();
    assert!(message.contains("musiclib_mobile.sh"));
    assert!(message.contains("/nonexistent/musiclib/bin"));
    assert!(!supervisor.is_running(Slot::Status));
}

#[tokio::test]
async fn test_cancel_terminates_running_operation() {
    let fixture = TestFixture::new();
    fixture.script("slow.sh", "exec sleep 30");
    let (mut supervisor, mut rx) = fixture.supervisor();

    supervisor
        .launch(Slot::Upload, &Invocation::script("slow.sh"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(supervisor.cancel(Slot::Upload));

    let (_, finished) = run_to_end(&mut rx).await;
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(!outcome.succeeded());
    assert!(!supervisor.cancel(Slot::Upload));
}

#[tokio::test]
async fn test_timeout_terminates_quick_query() {
    let fixture = TestFixture::new();
    fixture.script("slow.sh", "exec sleep 30");
    let (mut supervisor, mut rx) = fixture.supervisor();

    supervisor
        .launch(
            Slot::DeviceScan,
            &Invocation::script("slow.sh")
                .captured()
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap();

    let (_, finished) = run_to_end(&mut rx).await;
    let SupervisorEvent::Finished(outcome) = finished else {
        panic!("expected finished");
    };
    assert_eq!(outcome.termination, Termination::TimedOut);
    assert_eq!(
        outcome.status(),
        OutcomeStatus::Failed {
            diagnostic: "Timed out".to_string()
        }
    );
}

/// Feed supervisor events to the orchestrator until `done` holds.
async fn pump<F>(sync: &mut MobileSync<Supervisor>, rx: &mut SupervisorEvents, mut done: F)
where
    F: FnMut(&MobileSync<Supervisor>) -> bool,
{
    while !done(sync) {
        let event = next_event(rx).await;
        sync.handle_event(event);
    }
}

const MOBILE_SCRIPT: &str = r#"case "$1" in
  check-update) echo "STATUS:newer" ;;
  upload)
    echo "ACCOUNTING: Track 1/1: a.mp3"
    echo "UPLOAD: [1/2] a.mp3"
    echo "UPLOAD: [2/2] b.mp3"
    echo "$2" > "$MOBILE_DIR/uploaded"
    ;;
  status) echo "Current playlist: Road Trip" ;;
  *) exit 2 ;;
esac"#;

fn ready_sync(fixture: &TestFixture) -> (MobileSync<Supervisor>, SupervisorEvents) {
    fixture.script(
        "musiclib_mobile.sh",
        &format!(
            "MOBILE_DIR='{}'\n{MOBILE_SCRIPT}",
            fixture.mobile.path().display()
        ),
    );
    write_playlist(fixture.playlists.path(), "Road Trip.audpl");
    let config = fixture.config();
    let (supervisor, rx) = Supervisor::from_config(&config);
    let mut sync = MobileSync::new(config, supervisor);
    sync.refresh_playlists().unwrap();
    sync.select_playlist("Road Trip").unwrap();
    (sync, rx)
}

#[tokio::test]
async fn test_gate_halts_upload_when_source_is_newer() {
    let fixture = TestFixture::new();
    let (mut sync, mut rx) = ready_sync(&fixture);
    let mut observer = sync.subscribe();

    sync.scan_devices().unwrap().unwrap();
    pump(&mut sync, &mut rx, |s| s.devices().selected_id().is_some()).await;
    assert_eq!(sync.devices().selected_id(), Some("abcd1234"));

    let handle = sync
        .request_upload(UploadOptions {
            halt_if_newer: true,
            end_time: None,
        })
        .unwrap()
        .unwrap();
    assert_eq!(handle.slot, Slot::CheckUpdate);
    pump(&mut sync, &mut rx, |s| s.state().is_terminal()).await;

    assert_eq!(sync.state(), PipelineState::Halted);
    assert!(!fixture.mobile.path().join("uploaded").exists());
    let mut halted = false;
    while let Ok(event) = observer.try_recv() {
        halted |= matches!(event, SyncEvent::Halted { .. });
    }
    assert!(halted);
}

#[tokio::test]
async fn test_upload_completes_and_refreshes_status() {
    let fixture = TestFixture::new();
    let (mut sync, mut rx) = ready_sync(&fixture);

    sync.scan_devices().unwrap();
    pump(&mut sync, &mut rx, |s| s.devices().selected_id().is_some()).await;

    sync.request_upload(UploadOptions::default()).unwrap();
    pump(&mut sync, &mut rx, |s| {
        s.state().is_terminal() && s.status_text().is_some()
    })
    .await;

    assert_eq!(sync.state(), PipelineState::Completed);
    let session = sync.session().unwrap();
    assert_eq!((session.progress_current, session.progress_total), (2, 2));
    assert_eq!(sync.status_text(), Some("Current playlist: Road Trip"));

    let uploaded = fs::read_to_string(fixture.mobile.path().join("uploaded")).unwrap();
    assert!(uploaded.trim().ends_with("Road Trip.audpl"));
}
