//! Error types for voxrelay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // External process errors
    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("Pipeline process {process} failed: {message}")]
    Pipeline { process: String, message: String },

    // Stream errors
    #[error("Demux error: {message}")]
    Demux { message: String },

    #[error("Reassembly error: {message}")]
    Reassembly { message: String },

    // Voice transport errors
    #[error("Voice sink rejected packet: {message}")]
    Sink { message: String },

    #[error("Could not join voice destination {destination}: {message}")]
    Join {
        destination: String,
        message: String,
    },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a terminal playback failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Launch,
    Pipeline,
    Demux,
    Reassembly,
    Sink,
    Join,
    Io,
    Other,
}

impl RelayError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RelayError::ConfigParse { .. }
            | RelayError::ConfigInvalidValue { .. }
            | RelayError::Config(_) => FailureKind::Config,
            RelayError::Launch { .. } => FailureKind::Launch,
            RelayError::Pipeline { .. } => FailureKind::Pipeline,
            RelayError::Demux { .. } => FailureKind::Demux,
            RelayError::Reassembly { .. } => FailureKind::Reassembly,
            RelayError::Sink { .. } => FailureKind::Sink,
            RelayError::Join { .. } => FailureKind::Join,
            RelayError::Io(_) => FailureKind::Io,
            RelayError::Other(_) => FailureKind::Other,
        }
    }

    pub(crate) fn demux(message: impl Into<String>) -> Self {
        RelayError::Demux {
            message: message.into(),
        }
    }

    pub(crate) fn reassembly(message: impl Into<String>) -> Self {
        RelayError::Reassembly {
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RelayError>;
