//! Rendering of notifications and command results.
//!
//! Text mode prints one human line per notification worth showing. JSON mode
//! prints every notification as one JSON object per line, in the same
//! `{"type": ..., "data": ...}` shape the core serializes.

use musiclib_mobile_core::{ErrorKind, PipelineState, SyncEvent};
use serde::Serialize;
use tracing::{debug, warn};

/// Prints notifications and remembers the first failure.
#[derive(Debug, Default)]
pub struct Reporter {
    json: bool,
    last_progress: Option<String>,
    failure: Option<(ErrorKind, String)>,
}

impl Reporter {
    /// Create a reporter for text or JSON output.
    pub fn new(json: bool) -> Self {
        Self {
            json,
            ..Self::default()
        }
    }

    /// Take the first failure seen since the last call.
    pub fn take_failure(&mut self) -> Option<(ErrorKind, String)> {
        self.failure.take()
    }

    /// Render one notification.
    pub fn event(&mut self, event: &SyncEvent) {
        if let SyncEvent::Error { kind, message } = event
            && self.failure.is_none()
        {
            self.failure = Some((*kind, message.clone()));
        }

        if self.json {
            self.emit(event);
            return;
        }
        if let Some(line) = self.render(event) {
            println!("{line}");
        }
    }

    /// Print a command result.
    pub fn result<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) {
        if self.json {
            self.emit(value);
        } else {
            let text = text();
            if !text.is_empty() {
                println!("{text}");
            }
        }
    }

    fn emit<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Could not serialize output: {}", e),
        }
    }

    fn render(&mut self, event: &SyncEvent) -> Option<String> {
        match event {
            SyncEvent::Progress { label, .. } => {
                if self.last_progress.as_deref() == Some(label.as_str()) {
                    return None;
                }
                self.last_progress = Some(label.clone());
                Some(label.clone())
            }
            SyncEvent::Log { line, .. } => Some(line.clone()),
            SyncEvent::StateChanged {
                state: PipelineState::CheckingUpdate,
                playlist: Some(name),
            } => Some(format!("Checking '{name}' for a newer version...")),
            SyncEvent::StateChanged {
                state: PipelineState::Uploading,
                playlist: Some(name),
            } => Some(format!("Uploading '{name}'...")),
            SyncEvent::Halted { message } | SyncEvent::Status { text: message } => {
                Some(message.clone())
            }
            SyncEvent::UploadFinished {
                state,
                message,
                deferred,
            } => Some(match (state, deferred, message) {
                (PipelineState::Completed, _, _) => "Upload complete".to_string(),
                (_, true, Some(m)) => format!("Upload deferred: {m}"),
                (_, _, Some(m)) => format!("Upload failed: {m}"),
                (s, _, None) => format!("Upload ended: {s}"),
            }),
            SyncEvent::MaintenanceFinished { task, success, .. } => Some(if *success {
                format!("{task} complete")
            } else {
                format!("{task} failed")
            }),
            SyncEvent::Rated {
                path,
                stars,
                deferred,
            } => Some(format!(
                "Rated {} {}/5{}",
                path.display(),
                stars,
                if *deferred { " (queued)" } else { "" }
            )),
            SyncEvent::Error { message, .. } => {
                eprintln!("error: {message}");
                None
            }
            other => {
                debug!(?other, "Not rendered");
                None
            }
        }
    }
}
