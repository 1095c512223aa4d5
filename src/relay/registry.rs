//! Per-destination session ownership.
//!
//! At most one session plays to a destination at a time. A new request for
//! a busy destination cancels the running session and waits for it to tear
//! down before the new one joins, so the two never interleave on the sink.

use crate::error::{RelayError, Result};
use crate::relay::cancel::CancelToken;
use crate::relay::session::{PlaybackReport, Session, SessionState, SessionStatus};
use crate::relay::types::{DestinationId, MediaRequest};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

struct ActiveSession {
    cancel: CancelToken,
    status: SessionStatus,
    /// Disconnects when the session thread exits.
    finished: Receiver<()>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.status.get().is_terminal()
    }

    fn cancel_and_wait(&self) {
        self.cancel.cancel();
        // Only disconnection ends the wait.
        self.finished.recv().ok();
    }
}

/// Handle to a session started by a [`SessionRegistry`].
pub struct SessionHandle {
    destination: DestinationId,
    cancel: CancelToken,
    status: SessionStatus,
    thread: JoinHandle<Result<PlaybackReport>>,
}

impl SessionHandle {
    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the session ends and returns its outcome.
    pub fn wait(self) -> Result<PlaybackReport> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(RelayError::Other("session thread panicked".to_string())))
    }
}

/// Starts sessions and enforces one owner per destination.
pub struct SessionRegistry {
    session: Session,
    active: Mutex<HashMap<DestinationId, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<DestinationId, ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts playing `request`, superseding any session already playing to
    /// the same destination. Entries of finished sessions elsewhere are
    /// dropped.
    pub fn play(&self, request: MediaRequest) -> Result<SessionHandle> {
        let mut active = self.active();
        active.retain(|destination, session| {
            session.is_running() || *destination == request.destination
        });

        if let Some(previous) = active.remove(&request.destination)
            && previous.is_running()
        {
            tracing::info!(destination = %request.destination, "superseding running session");
            previous.cancel_and_wait();
        }

        let cancel = CancelToken::new();
        let status = SessionStatus::new();
        let (finished_tx, finished_rx) = crossbeam_channel::bounded::<()>(0);

        let thread = {
            let session = self.session.clone();
            let cancel = cancel.clone();
            let status = status.clone();
            let request = request.clone();
            thread::Builder::new()
                .name(format!("voxrelay-session-{}", request.destination))
                .spawn(move || {
                    let _finished = finished_tx;
                    session.run_with_status(&request, &cancel, &status)
                })?
        };

        active.insert(
            request.destination.clone(),
            ActiveSession {
                cancel: cancel.clone(),
                status: status.clone(),
                finished: finished_rx,
            },
        );

        Ok(SessionHandle {
            destination: request.destination,
            cancel,
            status,
            thread,
        })
    }

    /// Cancels the session playing to `destination` and waits for its
    /// teardown. Returns false when nothing was playing there.
    pub fn stop(&self, destination: &DestinationId) -> bool {
        let previous = self.active().remove(destination);
        match previous {
            Some(previous) if previous.is_running() => {
                previous.cancel_and_wait();
                true
            }
            _ => false,
        }
    }

    /// State of the latest session for `destination`, if any.
    pub fn state(&self, destination: &DestinationId) -> Option<SessionState> {
        self.active().get(destination).map(|s| s.status.get())
    }

    /// Destinations with a session that has not finished yet.
    pub fn active_destinations(&self) -> Vec<DestinationId> {
        let mut destinations: Vec<DestinationId> = self
            .active()
            .iter()
            .filter(|(_, session)| session.is_running())
            .map(|(destination, _)| destination.clone())
            .collect();
        destinations.sort();
        destinations
    }

    /// Cancels every running session and waits for all of them.
    pub fn shutdown(&self) {
        let drained: Vec<ActiveSession> = self.active().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.cancel.cancel();
        }
        for session in drained {
            session.finished.recv().ok();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybackConfig;
    use crate::ogg::PageWriter;
    use crate::process::MemoryPipeline;
    use crate::relay::sink::{CollectorSink, VoiceSink};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn registry(pipeline: MemoryPipeline, collector: &CollectorSink) -> SessionRegistry {
        let collector = collector.clone();
        let gateway = move |_: &DestinationId| -> Result<Box<dyn VoiceSink>> {
            Ok(Box::new(collector.clone()))
        };
        SessionRegistry::new(Session::new(
            Arc::new(pipeline),
            Arc::new(gateway),
            PlaybackConfig::default(),
        ))
    }

    fn wait_for(handle: &SessionHandle, state: SessionState) {
        let started = Instant::now();
        while handle.state() != state {
            assert!(started.elapsed() < Duration::from_secs(5), "never reached {state}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn finished_session_is_not_active() {
        let stream = PageWriter::new(1).write_stream(&[b"a"]).unwrap();
        let registry = registry(MemoryPipeline::new(stream), &CollectorSink::new());

        let handle = registry.play(MediaRequest::new("song", "room")).unwrap();
        let report = handle.wait().unwrap();

        assert_eq!(report.packets_sent, 1);
        assert_eq!(registry.state(&"room".into()), Some(SessionState::Closed));
        assert!(registry.active_destinations().is_empty());
        assert!(!registry.stop(&"room".into()));
    }

    #[test]
    fn finished_sessions_are_pruned_on_play() {
        let stream = PageWriter::new(1).write_stream(&[b"a"]).unwrap();
        let registry = registry(MemoryPipeline::new(stream), &CollectorSink::new());

        for room in ["a", "b", "c"] {
            registry.play(MediaRequest::new("song", room)).unwrap().wait().unwrap();
        }

        assert_eq!(registry.state(&"a".into()), None);
        assert_eq!(registry.state(&"b".into()), None);
        assert_eq!(registry.state(&"c".into()), Some(SessionState::Closed));
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn new_request_supersedes_running_session() {
        // No bytes and no end-of-stream: plays until cancelled.
        let pipeline = MemoryPipeline::new(Vec::new()).stall();
        let counters = pipeline.counters();
        let registry = registry(pipeline, &CollectorSink::new());

        let first = registry.play(MediaRequest::new("first", "room")).unwrap();
        wait_for(&first, SessionState::Streaming);

        let second = registry.play(MediaRequest::new("second", "room")).unwrap();
        // play() returns only after the first session tore down.
        assert!(first.state().is_terminal());
        let report = first.wait().unwrap();
        assert!(report.cancelled);

        assert_eq!(registry.active_destinations(), vec![DestinationId::new("room")]);
        assert!(registry.stop(&"room".into()));
        assert!(second.wait().unwrap().cancelled);
        assert_eq!(counters.launches(), 2);
        assert_eq!(counters.reaps(), 2);
    }

    #[test]
    fn destinations_are_independent() {
        let registry = registry(MemoryPipeline::new(Vec::new()).stall(), &CollectorSink::new());

        let a = registry.play(MediaRequest::new("x", "a")).unwrap();
        let b = registry.play(MediaRequest::new("y", "b")).unwrap();
        wait_for(&a, SessionState::Streaming);
        wait_for(&b, SessionState::Streaming);
        assert_eq!(
            registry.active_destinations(),
            vec![DestinationId::new("a"), DestinationId::new("b")]
        );

        registry.shutdown();
        assert!(a.wait().unwrap().cancelled);
        assert!(b.wait().unwrap().cancelled);
    }
}
