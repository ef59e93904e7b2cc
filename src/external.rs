//! The external collaborator surface (§6): interfaces the core consumes
//! from its host rather than implementing itself. Platform-specific
//! background-task integration, debug-dump rendering destinations, and
//! user-facing log levels are all explicitly out of scope for the core —
//! this module only pins down the shape a host plugs into.

use crate::debug::DebugRecord;
use crate::observer::Observer;
use crate::operation::Operation;
use std::sync::Arc;

/// Coarse application-lifecycle state a host reports to [`BackgroundObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Suspended,
}

/// A host-supplied source of application lifecycle state and background-task
/// extension, consumed by [`BackgroundObserver`]. The core never implements
/// this itself — it is platform-specific by nature.
pub trait AppStateSource: Send + Sync {
    fn current_state(&self) -> AppState;

    /// Request extra run time from the platform; returns an opaque token
    /// that must be passed back to [`AppStateSource::end_background_task`].
    fn begin_background_task(&self) -> u64;

    fn end_background_task(&self, token: u64);
}

/// Receives rendered [`DebugRecord`] trees. A host might forward these to a
/// log sink, a file, or an in-memory ring buffer for a debugging UI; the
/// core only produces the record, never decides where it goes.
pub trait DebugSink: Send + Sync {
    fn record(&self, record: &DebugRecord);
}

/// Starts a platform background task when the application suspends while
/// operations are still in flight, and ends it once they finish or the
/// application resumes.
pub struct BackgroundObserver<S: AppStateSource> {
    source: Arc<S>,
}

impl<S: AppStateSource + 'static> BackgroundObserver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Attach to `operation`: if the application is already suspended when
    /// this is called, begin a background task and install a `did_finish`
    /// observer that ends it once `operation` finishes (whether it succeeds,
    /// fails, or is cancelled). A no-op if the application is active — there
    /// is no state-transition notification in this trait to attach a
    /// mid-flight suspend to, only the state as observed at attach time.
    pub fn attach(&self, operation: &Operation) {
        if self.source.current_state() != AppState::Suspended {
            return;
        }

        let token = self.source.begin_background_task();
        tracing::debug!(token, operation = %operation.name(), "began background task for suspended operation");

        let source = Arc::clone(&self.source);
        operation.add_observer(Observer::new().on_did_finish(move |op| {
            tracing::debug!(token, operation = %op.name(), "ending background task");
            source.end_background_task(token);
        }));
    }
}
