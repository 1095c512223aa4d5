//! External process pipeline.
//!
//! The relay never talks to the fetch and transcode tools directly. It asks a
//! [`MediaPipeline`] for a byte stream and gets back the stream plus a
//! [`PipelineControl`] that supervises whatever produced it. The production
//! implementation chains two child processes ([`CommandPipeline`]); tests use
//! an in-memory transformer ([`MemoryPipeline`]).

pub mod command;
pub mod group;
pub mod memory;

pub use command::{CommandPipeline, CommandSpec, TemplateVars};
pub use group::ProcessGroup;
pub use memory::{MemoryPipeline, MemoryCounters};

use crate::error::{RelayError, Result};
use std::fmt;
use std::io::Read;
use std::sync::Arc;

/// Something that turns a source reference into a container byte stream.
pub trait MediaPipeline: Send + Sync {
    /// Starts producing the stream for `source`.
    ///
    /// Fails with [`RelayError::Launch`] before any byte is produced if the
    /// producer cannot be started.
    fn launch(&self, source: &str) -> Result<LaunchedPipeline>;
}

/// A running pipeline: its output stream and its supervisor.
pub struct LaunchedPipeline {
    pub output: Box<dyn Read + Send>,
    pub control: Arc<dyn PipelineControl>,
}

/// How [`PipelineControl::close`] should bring the producer down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// The stream ended normally: allow a natural exit, force it after the grace period.
    Drain,
    /// Playback was cancelled or failed: terminate immediately.
    Abort,
}

/// Supervision of a running pipeline.
pub trait PipelineControl: Send + Sync {
    /// A failure observed so far, e.g. a child that exited unsuccessfully.
    fn failure(&self) -> Option<ProcessFailure>;

    /// Stops producing without waiting for a natural exit. Idempotent.
    fn terminate(&self);

    /// Reaps everything the pipeline started. Runs at most once; later calls
    /// return the first call's outcome.
    fn close(&self, mode: CloseMode) -> Result<()>;
}

/// An abnormal exit of one pipeline process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub process: String,
    pub message: String,
}

impl ProcessFailure {
    pub fn new(process: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.process, self.message)
    }
}

impl From<ProcessFailure> for RelayError {
    fn from(failure: ProcessFailure) -> Self {
        RelayError::Pipeline {
            process: failure.process,
            message: failure.message,
        }
    }
}
