//! In-memory pipeline for tests and offline playback.
//!
//! Serves a prepared container byte stream as if it came from the transcode
//! tool, with knobs for the failure modes a real child process has: refusing
//! to start, exiting unsuccessfully, corrupting its output and hanging.

use crate::error::{RelayError, Result};
use crate::process::{CloseMode, LaunchedPipeline, MediaPipeline, PipelineControl, ProcessFailure};
use bytes::Bytes;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

/// Counts what happened to the pipelines a [`MemoryPipeline`] launched.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounters {
    inner: Arc<Tallies>,
}

#[derive(Debug, Default)]
struct Tallies {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    reaps: AtomicUsize,
    sources: Mutex<Vec<String>>,
}

impl MemoryCounters {
    pub fn launches(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Pipelines that were asked to stop early.
    pub fn terminations(&self) -> usize {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    /// Pipelines that were closed (on any path).
    pub fn reaps(&self) -> usize {
        self.inner.reaps.load(Ordering::SeqCst)
    }

    /// Source references passed to `launch`, in order.
    pub fn sources(&self) -> Vec<String> {
        self.inner
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A [`MediaPipeline`] that replays a fixed byte stream.
#[derive(Debug, Clone)]
pub struct MemoryPipeline {
    stream: Bytes,
    corrupt: Vec<usize>,
    failure: Option<ProcessFailure>,
    launch_error: Option<String>,
    stall: bool,
    chunk_size: usize,
    counters: MemoryCounters,
}

impl MemoryPipeline {
    pub fn new(stream: impl Into<Bytes>) -> Self {
        Self {
            stream: stream.into(),
            corrupt: Vec::new(),
            failure: None,
            launch_error: None,
            stall: false,
            chunk_size: 4096,
            counters: MemoryCounters::default(),
        }
    }

    /// Flips every bit of the byte at `offset` in the served stream.
    pub fn corrupt_byte(mut self, offset: usize) -> Self {
        self.corrupt.push(offset);
        self
    }

    /// Reports `process` as having failed once the stream is exhausted.
    pub fn fail_with(mut self, process: &str, message: &str) -> Self {
        self.failure = Some(ProcessFailure::new(process, message));
        self
    }

    /// Makes `launch` fail before producing anything.
    pub fn fail_launch(mut self, message: &str) -> Self {
        self.launch_error = Some(message.to_string());
        self
    }

    /// After the stream is served, block instead of reporting end-of-file
    /// until the pipeline is terminated.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Largest read served at once (at least 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn counters(&self) -> MemoryCounters {
        self.counters.clone()
    }

    fn served_stream(&self) -> Bytes {
        if self.corrupt.is_empty() {
            return self.stream.clone();
        }
        let mut data = self.stream.to_vec();
        for &offset in &self.corrupt {
            if let Some(byte) = data.get_mut(offset) {
                *byte = !*byte;
            }
        }
        Bytes::from(data)
    }
}

impl MediaPipeline for MemoryPipeline {
    fn launch(&self, source: &str) -> Result<LaunchedPipeline> {
        if let Some(message) = &self.launch_error {
            return Err(RelayError::Launch {
                program: "memory".to_string(),
                message: message.clone(),
            });
        }

        self.counters.inner.launches.fetch_add(1, Ordering::SeqCst);
        self.counters
            .inner
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.to_string());

        let state = Arc::new(RunState::default());
        let reader = MemoryReader {
            data: self.served_stream(),
            position: 0,
            chunk_size: self.chunk_size,
            stall: self.stall,
            state: state.clone(),
        };
        let control = MemoryControl {
            state,
            failure: self.failure.clone(),
            counters: self.counters.clone(),
            outcome: OnceLock::new(),
        };

        Ok(LaunchedPipeline {
            output: Box::new(reader),
            control: Arc::new(control),
        })
    }
}

#[derive(Debug, Default)]
struct RunState {
    flags: Mutex<RunFlags>,
    changed: Condvar,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunFlags {
    /// The producer ran out of data on its own.
    exhausted: bool,
    terminated: bool,
}

impl RunState {
    fn flags(&self) -> MutexGuard<'_, RunFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryReader {
    data: Bytes,
    position: usize,
    chunk_size: usize,
    stall: bool,
    state: Arc<RunState>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.state.flags().terminated {
            return Ok(0);
        }

        let remaining = &self.data[self.position..];
        if !remaining.is_empty() {
            let n = remaining.len().min(buf.len()).min(self.chunk_size);
            buf[..n].copy_from_slice(&remaining[..n]);
            self.position += n;
            return Ok(n);
        }

        let mut flags = self.state.flags();
        if self.stall {
            while !flags.terminated {
                flags = self
                    .state
                    .changed
                    .wait(flags)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        } else {
            flags.exhausted = true;
        }
        Ok(0)
    }
}

struct MemoryControl {
    state: Arc<RunState>,
    failure: Option<ProcessFailure>,
    counters: MemoryCounters,
    outcome: OnceLock<std::result::Result<(), ProcessFailure>>,
}

impl MemoryControl {
    fn shutdown(&self, mode: CloseMode) -> std::result::Result<(), ProcessFailure> {
        if mode == CloseMode::Abort {
            self.terminate();
        }
        self.counters.inner.reaps.fetch_add(1, Ordering::SeqCst);
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl PipelineControl for MemoryControl {
    fn failure(&self) -> Option<ProcessFailure> {
        if self.state.flags().exhausted {
            self.failure.clone()
        } else {
            None
        }
    }

    fn terminate(&self) {
        let mut flags = self.state.flags();
        if !flags.terminated && !flags.exhausted {
            self.counters.inner.terminations.fetch_add(1, Ordering::SeqCst);
        }
        flags.terminated = true;
        self.state.changed.notify_all();
    }

    fn close(&self, mode: CloseMode) -> Result<()> {
        self.outcome
            .get_or_init(|| self.shutdown(mode))
            .clone()
            .map_err(Into::into)
    }
}

impl Drop for MemoryControl {
    fn drop(&mut self) {
        if self.outcome.get().is_none()
            && let Err(e) = self.close(CloseMode::Abort)
        {
            tracing::debug!(error = %e, "memory pipeline closed on drop");
        }
    }
}
