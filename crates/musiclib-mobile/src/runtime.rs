//! Async runtime and the session event loop.
//!
//! The whole tool runs on a single-threaded Tokio runtime. Supervised
//! operations are spawned tasks on that runtime; their events are funnelled
//! back into [`MobileSync`] here, so the orchestrator itself is only ever
//! touched from one place.

use std::time::Duration;

use musiclib_mobile_core::{AppConfig, MobileSync, Supervisor, SupervisorEvents, SyncEvent};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Extra time granted after the termination grace before giving up on outcomes.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Build the runtime used by the binary.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn build() -> std::io::Result<Runtime> {
    debug!("Initializing current-thread runtime");
    Builder::new_current_thread().enable_all().build()
}

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Every launched operation has delivered its outcome.
    Idle,
    /// The user pressed Ctrl-C.
    Interrupted,
}

/// A [`MobileSync`] wired to a live [`Supervisor`].
pub struct Session {
    sync: MobileSync<Supervisor>,
    events: SupervisorEvents,
    updates: broadcast::Receiver<SyncEvent>,
    grace: Duration,
}

impl Session {
    /// Create a session for `config`.
    pub fn open(config: AppConfig) -> Self {
        let grace = config.timeouts.termination_grace();
        let (supervisor, events) = Supervisor::from_config(&config);
        let sync = MobileSync::new(config, supervisor);
        let updates = sync.subscribe();
        Self {
            sync,
            events,
            updates,
            grace,
        }
    }

    /// The orchestrator.
    pub const fn sync(&mut self) -> &mut MobileSync<Supervisor> {
        &mut self.sync
    }

    /// Pass every queued notification to `sink`.
    pub fn flush<F: FnMut(&SyncEvent)>(&mut self, sink: &mut F) {
        loop {
            match self.updates.try_recv() {
                Ok(event) => sink(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Dropped {} notifications", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Feed supervisor events to the orchestrator until nothing is pending.
    pub async fn run_until_idle<F: FnMut(&SyncEvent)>(&mut self, sink: &mut F) -> LoopExit {
        loop {
            self.flush(sink);
            if self.sync.is_idle() {
                return LoopExit::Idle;
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.sync.handle_event(event),
                    None => {
                        warn!("Supervisor channel closed with operations pending");
                        return LoopExit::Idle;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping running operations");
                    self.shutdown(sink).await;
                    return LoopExit::Interrupted;
                }
            }
        }
    }

    /// Stop everything and collect outcomes until the grace period runs out.
    pub async fn shutdown<F: FnMut(&SyncEvent)>(&mut self, sink: &mut F) {
        self.sync.shutdown();
        let deadline = Instant::now() + self.grace + SHUTDOWN_SLACK;
        while !self.sync.is_idle() {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    self.sync.handle_event(event);
                    // Continuations may have launched follow-up work.
                    self.sync.shutdown();
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "{} operation(s) did not report back before shutdown",
                        self.sync.pending_operations()
                    );
                    break;
                }
            }
        }
        self.flush(sink);
    }
}
