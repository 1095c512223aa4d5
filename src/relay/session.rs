//! Playback lifecycle for one request.
//!
//! ```text
//! Idle → Joining → Streaming → Draining → Closed
//!           │          │           │
//!           └──────────┴───────────┴────→ Errored
//! ```
//!
//! A session joins the destination, launches the pipeline and runs two
//! threads of work joined by a bounded queue: a producer (demux, reassemble,
//! filter, enqueue) and the paced sender on the calling thread. A watcher
//! thread turns cancellation into pipeline termination, which unblocks a
//! producer stuck reading the pipe. Teardown always closes the pipeline and
//! clears the speaking indicator before the outcome is reported.

use crate::config::PlaybackConfig;
use crate::error::{FailureKind, RelayError, Result};
use crate::ogg::Demuxer;
use crate::process::{CloseMode, LaunchedPipeline, MediaPipeline, PipelineControl};
use crate::relay::cancel::CancelToken;
use crate::relay::headers::HeaderFilter;
use crate::relay::reassembler::packets;
use crate::relay::sender::{PacedSender, SendReport};
use crate::relay::sink::{VoiceGateway, VoiceSink};
use crate::relay::types::{DestinationId, MediaRequest, Packet};
use crossbeam_channel::{Receiver, Sender, select};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Lifecycle state of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Joining = 1,
    Streaming = 2,
    Draining = 3,
    Closed = 4,
    Errored = 5,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    /// Closed and Errored are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Joining)
                | (Joining, Streaming)
                | (Joining, Draining)
                | (Joining, Errored)
                | (Streaming, Draining)
                | (Streaming, Errored)
                | (Draining, Closed)
                | (Draining, Errored)
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Joining,
            2 => SessionState::Streaming,
            3 => SessionState::Draining,
            4 => SessionState::Closed,
            _ => SessionState::Errored,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable state of one session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    state: Arc<AtomicU8>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves to `next` if the lifecycle allows it. Invalid transitions are
    /// logged and ignored.
    fn advance(&self, next: SessionState) -> bool {
        let current = self.get();
        if !current.can_transition_to(next) {
            tracing::error!(from = %current, to = %next, "invalid session transition");
            return false;
        }
        self.state.store(next as u8, Ordering::SeqCst);
        tracing::info!(from = %current, to = %next, "session state");
        true
    }
}

/// Summary of a finished (closed) playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub destination: DestinationId,
    pub packets_sent: u64,
    pub pages_read: u64,
    pub headers_skipped: u64,
    pub cancelled: bool,
    pub state: SessionState,
    pub elapsed: Duration,
}

/// What the producer thread saw.
#[derive(Debug, Default)]
struct ProducerOutcome {
    pages: u64,
    headers_skipped: u64,
    error: Option<RelayError>,
}

/// Everything the streaming phase produced, after teardown.
struct StreamOutcome {
    sent: Result<SendReport>,
    producer: ProducerOutcome,
    pipeline: Result<()>,
}

/// Runs playback requests against a pipeline and a voice gateway.
#[derive(Clone)]
pub struct Session {
    pipeline: Arc<dyn MediaPipeline>,
    gateway: Arc<dyn VoiceGateway>,
    playback: PlaybackConfig,
}

impl Session {
    pub fn new(
        pipeline: Arc<dyn MediaPipeline>,
        gateway: Arc<dyn VoiceGateway>,
        playback: PlaybackConfig,
    ) -> Self {
        Self {
            pipeline,
            gateway,
            playback,
        }
    }

    pub fn playback(&self) -> &PlaybackConfig {
        &self.playback
    }

    /// Plays `request` to completion, cancellation or failure.
    pub fn run(&self, request: &MediaRequest, cancel: &CancelToken) -> Result<PlaybackReport> {
        self.run_with_status(request, cancel, &SessionStatus::new())
    }

    /// Like [`Session::run`], publishing state changes to `status`.
    pub fn run_with_status(
        &self,
        request: &MediaRequest,
        cancel: &CancelToken,
        status: &SessionStatus,
    ) -> Result<PlaybackReport> {
        let started = Instant::now();
        let destination = &request.destination;
        let span = tracing::info_span!("session", destination = %destination);
        let _enter = span.enter();

        status.advance(SessionState::Joining);
        let mut sink = match self.gateway.join(destination) {
            Ok(sink) => sink,
            Err(e) => {
                let e = as_join_error(e, destination);
                status.advance(SessionState::Errored);
                tracing::error!(error = %e, "join failed");
                return Err(e);
            }
        };

        let mut report = PlaybackReport {
            destination: destination.clone(),
            packets_sent: 0,
            pages_read: 0,
            headers_skipped: 0,
            cancelled: false,
            state: SessionState::Joining,
            elapsed: Duration::ZERO,
        };

        if cancel.is_cancelled() {
            tracing::info!("cancelled before streaming");
            status.advance(SessionState::Draining);
            status.advance(SessionState::Closed);
            report.cancelled = true;
            report.state = SessionState::Closed;
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let launched = match self.pipeline.launch(&request.source) {
            Ok(launched) => launched,
            Err(e) => {
                status.advance(SessionState::Errored);
                tracing::error!(error = %e, "pipeline launch failed");
                return Err(e);
            }
        };
        status.advance(SessionState::Streaming);

        let outcome = self.stream(launched, sink.as_mut(), cancel);
        drop(sink);

        report.pages_read = outcome.producer.pages;
        report.headers_skipped = outcome.producer.headers_skipped;
        if let Ok(sent) = &outcome.sent {
            report.packets_sent = sent.packets;
        }
        report.elapsed = started.elapsed();

        if cancel.is_cancelled() {
            log_suppressed(&outcome);
            status.advance(SessionState::Draining);
            status.advance(SessionState::Closed);
            report.cancelled = true;
            report.state = SessionState::Closed;
            tracing::info!(packets = report.packets_sent, "playback cancelled");
            return Ok(report);
        }

        match terminal_error(outcome) {
            Some(e) => {
                status.advance(SessionState::Errored);
                tracing::error!(error = %e, kind = ?e.kind(), "playback failed");
                Err(e)
            }
            None => {
                status.advance(SessionState::Draining);
                status.advance(SessionState::Closed);
                report.state = SessionState::Closed;
                tracing::info!(
                    packets = report.packets_sent,
                    pages = report.pages_read,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "playback finished"
                );
                Ok(report)
            }
        }
    }

    /// Runs producer, watcher and sender, then closes the pipeline.
    fn stream(
        &self,
        launched: LaunchedPipeline,
        sink: &mut dyn VoiceSink,
        cancel: &CancelToken,
    ) -> StreamOutcome {
        let LaunchedPipeline { output, control } = launched;
        let halt = CancelToken::new();
        let (packet_tx, packet_rx) = crossbeam_channel::bounded(self.playback.queue_capacity.max(1));
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let mut sender = if self.playback.realtime {
            PacedSender::with_pacing(self.playback.frame_duration())
        } else {
            PacedSender::new()
        };

        let (sent, producer) = thread::scope(|scope| {
            let watcher = {
                let (halt, done_rx, control) = (&halt, &done_rx, control.as_ref());
                thread::Builder::new()
                    .name("voxrelay-watcher".to_string())
                    .spawn_scoped(scope, move || watch(cancel, halt, done_rx, control))
            };
            if let Err(e) = &watcher {
                tracing::error!(error = %e, "could not start watcher thread");
                halt.cancel();
                control.terminate();
            }

            let producer = {
                let (halt, playback, control) = (&halt, &self.playback, control.as_ref());
                thread::Builder::new()
                    .name("voxrelay-producer".to_string())
                    .spawn_scoped(scope, move || {
                        produce(output, packet_tx, halt, playback, control)
                    })
            };

            let sent = sender.run(&packet_rx, sink, &halt);
            if sent.is_err() {
                halt.cancel();
            }
            drop(packet_rx);

            let producer = match producer {
                Ok(handle) => handle.join().unwrap_or_else(|_| ProducerOutcome {
                    error: Some(RelayError::Other("producer thread panicked".to_string())),
                    ..ProducerOutcome::default()
                }),
                Err(e) => ProducerOutcome {
                    error: Some(RelayError::Other(format!(
                        "could not start producer thread: {e}"
                    ))),
                    ..ProducerOutcome::default()
                },
            };
            if producer.error.is_some() {
                halt.cancel();
                control.terminate();
            }

            drop(done_tx);
            if let Ok(handle) = watcher
                && handle.join().is_err()
            {
                tracing::warn!("watcher thread panicked");
            }
            (sent, producer)
        });

        let mode = if halt.is_cancelled() || cancel.is_cancelled() {
            CloseMode::Abort
        } else {
            CloseMode::Drain
        };
        tracing::debug!(?mode, "closing pipeline");
        let pipeline = control.close(mode);

        StreamOutcome {
            sent,
            producer,
            pipeline,
        }
    }
}

/// Waits for cancellation, a producer/sender halt, or the end of streaming.
fn watch(
    cancel: &CancelToken,
    halt: &CancelToken,
    done: &Receiver<()>,
    control: &dyn PipelineControl,
) {
    select! {
        recv(cancel.signal()) -> _ => {},
        recv(halt.signal()) -> _ => {},
        recv(done) -> _ => {},
    }
    if cancel.is_cancelled() || halt.is_cancelled() {
        if cancel.is_cancelled() {
            tracing::info!("cancellation requested, stopping pipeline");
        }
        halt.cancel();
        control.terminate();
    }
}

/// Producer path: pipe → pages → packets → header filter → queue.
///
/// A broken stream is blamed on the pipeline when one of its processes has
/// already failed.
fn produce(
    output: Box<dyn Read + Send>,
    queue: Sender<Packet>,
    halt: &CancelToken,
    playback: &PlaybackConfig,
    control: &dyn PipelineControl,
) -> ProducerOutcome {
    let mut demuxer = Demuxer::new(output).with_checksum_verification(playback.verify_checksum);
    let mut filter = HeaderFilter::new(playback.skip_codec_headers);
    let mut error = None;
    let mut queued = 0u64;
    let mut stream = packets(&mut demuxer);

    for result in stream.by_ref() {
        if halt.is_cancelled() {
            break;
        }
        let packet = match result {
            Ok(packet) => packet,
            Err(e) => {
                error = Some(e);
                break;
            }
        };
        if !filter.accept(&packet) {
            continue;
        }
        // Blocks while the queue is full.
        let delivered = select! {
            send(queue, packet) -> sent => sent.is_ok(),
            recv(halt.signal()) -> _ => false,
        };
        if !delivered {
            break;
        }
        queued += 1;
    }

    let reassembled = stream.reassembler().packets_emitted();
    drop(stream);

    let error = error.map(|e| match (control.failure(), e) {
        (Some(failure), cause) => {
            tracing::debug!(error = %cause, "stream broken by failed process");
            RelayError::from(failure)
        }
        (None, RelayError::Io(io)) => RelayError::Pipeline {
            process: "output".to_string(),
            message: format!("read failed: {io}"),
        },
        (None, other) => other,
    });
    if let Some(e) = &error {
        tracing::warn!(error = %e, pages = demuxer.pages(), "stream aborted");
        halt.cancel();
    }
    tracing::debug!(
        pages = demuxer.pages(),
        reassembled,
        queued,
        "producer finished"
    );

    ProducerOutcome {
        pages: demuxer.pages(),
        headers_skipped: filter.dropped(),
        error,
    }
}

/// Picks the error to report: sink, then pipeline process, then stream.
fn terminal_error(outcome: StreamOutcome) -> Option<RelayError> {
    let StreamOutcome {
        sent,
        producer,
        pipeline,
    } = outcome;

    if let Err(e) = sent {
        return Some(e);
    }
    if let Err(e) = pipeline {
        return Some(e);
    }
    producer.error
}

fn log_suppressed(outcome: &StreamOutcome) {
    let errors = [
        outcome.sent.as_ref().err(),
        outcome.pipeline.as_ref().err(),
        outcome.producer.error.as_ref(),
    ];
    for error in errors.into_iter().flatten() {
        tracing::debug!(error = %error, "ignoring failure after cancellation");
    }
}

fn as_join_error(error: RelayError, destination: &DestinationId) -> RelayError {
    if error.kind() == FailureKind::Join {
        error
    } else {
        RelayError::Join {
            destination: destination.to_string(),
            message: error.to_string(),
        }
    }
}
