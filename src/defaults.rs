//! Default configuration constants for voxrelay.
//!
//! Shared by the configuration types, the command pipeline and the relay
//! so that every layer agrees on the stream format.

/// Opus output sample rate in Hz.
///
/// Voice transports expect 48kHz Opus; anything else is resampled by the
/// transcoder before it reaches us.
pub const SAMPLE_RATE: u32 = 48000;

/// Output channel count (stereo).
pub const CHANNELS: u32 = 2;

/// Target Opus bitrate, in the transcoder's own notation.
pub const BITRATE: &str = "96K";

/// Playout duration of a single Opus packet in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;

/// Capacity of the packet queue between the demux thread and the sender.
///
/// 64 packets at 20ms is roughly 1.3 seconds of look-ahead.
pub const QUEUE_CAPACITY: usize = 64;

/// Time given to child processes to exit after SIGTERM (or after the end of
/// the stream) before they are force-killed.
pub const TERMINATE_GRACE_MS: u64 = 2000;

/// Interval at which the process supervisor checks child exit status.
pub const POLL_INTERVAL_MS: u64 = 50;

/// Default fetch tool.
pub const FETCH_PROGRAM: &str = "yt-dlp";

/// Default transcode tool.
pub const TRANSCODE_PROGRAM: &str = "ffmpeg";

/// Placeholder substituted with the source reference in argument templates.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Default fetch arguments: best audio stream, written to stdout.
pub fn fetch_args() -> Vec<String> {
    ["-o", "-", "-f", "bestaudio", SOURCE_PLACEHOLDER]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Default transcode arguments: raw media on stdin, Ogg/Opus on stdout.
pub fn transcode_args() -> Vec<String> {
    [
        "-i",
        "-",
        "-c:a",
        "libopus",
        "-b:a",
        "{bitrate}",
        "-ar",
        "{sample_rate}",
        "-ac",
        "{channels}",
        "-f",
        "ogg",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
