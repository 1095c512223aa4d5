//! voxrelay - real-time Opus relay for voice transports
//!
//! Fetches a remote audio source through external tools, demultiplexes the
//! transcoder's Ogg output, reassembles Opus packets and paces them into a
//! voice sink.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
#[cfg(feature = "cli")]
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod ogg;
pub mod process;
pub mod relay;

// Core seams (pipeline → relay → sink)
pub use process::{CommandPipeline, MediaPipeline, MemoryPipeline, PipelineControl};
pub use relay::{VoiceGateway, VoiceSink};

// Sessions
pub use relay::{
    CancelToken, DestinationId, MediaRequest, Packet, PlaybackReport, Session, SessionHandle,
    SessionRegistry, SessionState,
};

// Container
pub use ogg::{Demuxer, Page, PageWriter};

// Error handling
pub use error::{FailureKind, RelayError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
