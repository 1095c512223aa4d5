//! Consumer side of the relay: drains the packet queue into the sink.

use crate::error::{FailureKind, RelayError, Result};
use crate::relay::cancel::CancelToken;
use crate::relay::sink::VoiceSink;
use crate::relay::types::Packet;
use crossbeam_channel::{Receiver, select};
use std::time::{Duration, Instant};

/// Falling further behind than this many frames restarts the schedule
/// instead of bursting to catch up.
const MAX_LAG_FRAMES: u32 = 10;

/// Schedules packets against absolute deadlines one frame apart, so
/// per-packet jitter does not accumulate into drift.
#[derive(Debug, Clone)]
pub struct Pacer {
    frame: Duration,
    next_deadline: Option<Instant>,
}

impl Pacer {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            next_deadline: None,
        }
    }

    /// How long to hold the next packet, given the current time. The first
    /// packet goes out immediately and anchors the schedule.
    pub fn delay(&mut self, now: Instant) -> Duration {
        let deadline = *self.next_deadline.get_or_insert(now);
        if now > deadline + self.frame * MAX_LAG_FRAMES {
            tracing::debug!(
                behind_ms = now.duration_since(deadline).as_millis() as u64,
                "pacer fell behind, resynchronising"
            );
            self.next_deadline = Some(now + self.frame);
            return Duration::ZERO;
        }
        self.next_deadline = Some(deadline + self.frame);
        deadline.saturating_duration_since(now)
    }
}

/// Outcome of a completed send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub packets: u64,
    /// Stopped by the halt signal rather than by draining the queue.
    pub cancelled: bool,
}

/// Hands packets to a [`VoiceSink`] in queue order.
///
/// The speaking indicator goes on right before the first packet and off
/// exactly once when the loop ends, whether drained, cancelled or failed.
#[derive(Debug, Clone, Default)]
pub struct PacedSender {
    pacer: Option<Pacer>,
}

impl PacedSender {
    /// Relies on the sink to pace delivery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds each packet to the given frame cadence.
    pub fn with_pacing(frame: Duration) -> Self {
        Self {
            pacer: Some(Pacer::new(frame)),
        }
    }

    /// Runs until the queue disconnects (producer finished), `halt` fires,
    /// or the sink fails.
    pub fn run(
        &mut self,
        queue: &Receiver<Packet>,
        sink: &mut dyn VoiceSink,
        halt: &CancelToken,
    ) -> Result<SendReport> {
        let mut sent = 0u64;
        let mut speaking = false;

        let outcome = loop {
            let received = select! {
                recv(queue) -> message => Some(message),
                recv(halt.signal()) -> _ => None,
            };
            let packet = match received {
                Some(Ok(packet)) => packet,
                // Producer finished and the queue is drained.
                Some(Err(_)) => break Ok(false),
                None => break Ok(true),
            };
            // select! picks randomly when both arms are ready.
            if halt.is_cancelled() {
                break Ok(true);
            }

            if let Some(pacer) = self.pacer.as_mut() {
                let delay = pacer.delay(Instant::now());
                if !delay.is_zero() && halt.wait_timeout(delay) {
                    break Ok(true);
                }
            }

            if !speaking {
                if let Err(e) = sink.set_speaking(true) {
                    break Err(e);
                }
                speaking = true;
            }
            if let Err(e) = sink.send_packet(&packet) {
                break Err(e);
            }
            sent += 1;
        };

        if speaking && let Err(e) = sink.set_speaking(false) {
            tracing::warn!(sink = sink.name(), error = %e, "failed to clear speaking indicator");
        }

        match outcome {
            Ok(cancelled) => {
                tracing::debug!(sink = sink.name(), packets = sent, cancelled, "send loop finished");
                Ok(SendReport {
                    packets: sent,
                    cancelled,
                })
            }
            Err(e) => {
                tracing::warn!(sink = sink.name(), packets = sent, error = %e, "sink failed");
                Err(as_sink_error(e))
            }
        }
    }
}

fn as_sink_error(error: RelayError) -> RelayError {
    if error.kind() == FailureKind::Sink {
        error
    } else {
        RelayError::Sink {
            message: error.to_string(),
        }
    }
}
