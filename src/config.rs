use crate::defaults;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub transcode: TranscodeConfig,
    pub playback: PlaybackConfig,
}

/// Source-fetch tool: emits compressed media on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub program: String,
    /// Argument template; `{source}` is replaced with the source reference.
    pub args: Vec<String>,
}

/// Transcode tool: raw media on stdin, Ogg/Opus on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscodeConfig {
    pub program: String,
    /// Argument template; `{sample_rate}`, `{channels}` and `{bitrate}` are substituted.
    pub args: Vec<String>,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: String,
}

/// Relay and teardown behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Bound of the packet queue between the demux thread and the sender.
    pub queue_capacity: usize,
    pub frame_duration_ms: u64,
    /// Hold each packet to the frame cadence instead of relying on the sink.
    pub realtime: bool,
    /// Drop the OpusHead/OpusTags packets before they reach the sink.
    pub skip_codec_headers: bool,
    pub verify_checksum: bool,
    pub terminate_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            program: defaults::FETCH_PROGRAM.to_string(),
            args: defaults::fetch_args(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: defaults::TRANSCODE_PROGRAM.to_string(),
            args: defaults::transcode_args(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            bitrate: defaults::BITRATE.to_string(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            frame_duration_ms: defaults::FRAME_DURATION_MS,
            realtime: false,
            skip_codec_headers: true,
            verify_checksum: true,
            terminate_grace_ms: defaults::TERMINATE_GRACE_MS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e.context(format!("Failed to load config from {}", path.display())))
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXRELAY_FETCH_PROGRAM → fetch.program
    /// - VOXRELAY_TRANSCODE_PROGRAM → transcode.program
    /// - VOXRELAY_QUEUE_CAPACITY → playback.queue_capacity (ignored unless numeric)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var("VOXRELAY_FETCH_PROGRAM")
            && !program.is_empty()
        {
            self.fetch.program = program;
        }

        if let Ok(program) = std::env::var("VOXRELAY_TRANSCODE_PROGRAM")
            && !program.is_empty()
        {
            self.transcode.program = program;
        }

        if let Ok(capacity) = std::env::var("VOXRELAY_QUEUE_CAPACITY")
            && let Ok(capacity) = capacity.trim().parse::<usize>()
        {
            self.playback.queue_capacity = capacity;
        }

        self
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> RelayError {
            RelayError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        if self.fetch.program.trim().is_empty() {
            return Err(invalid("fetch.program", "must not be empty"));
        }
        if self.transcode.program.trim().is_empty() {
            return Err(invalid("transcode.program", "must not be empty"));
        }
        if self.transcode.sample_rate == 0 {
            return Err(invalid("transcode.sample_rate", "must be greater than zero"));
        }
        if self.transcode.channels == 0 {
            return Err(invalid("transcode.channels", "must be greater than zero"));
        }
        if self.playback.queue_capacity == 0 {
            return Err(invalid(
                "playback.queue_capacity",
                "must be greater than zero",
            ));
        }
        if self.playback.frame_duration_ms == 0 {
            return Err(invalid(
                "playback.frame_duration_ms",
                "must be greater than zero",
            ));
        }
        if self.playback.poll_interval_ms == 0 {
            return Err(invalid(
                "playback.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RelayError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Commented configuration template with every key at its default.
    pub fn dump_template() -> String {
        let quoted = |args: Vec<String>| {
            args.iter()
                .map(|a| format!("\"{a}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            r#"# voxrelay configuration
# Location: {path}

[fetch]
# Tool that writes the source media to stdout.
program = "{fetch_program}"
# {{source}} is replaced with the source reference.
args = [{fetch_args}]

[transcode]
# Tool that reads media on stdin and writes Ogg/Opus to stdout.
program = "{transcode_program}"
# {{sample_rate}}, {{channels}} and {{bitrate}} are substituted below.
args = [{transcode_args}]
sample_rate = {sample_rate}
channels = {channels}
bitrate = "{bitrate}"

[playback]
# Packets buffered between the demuxer and the sender.
queue_capacity = {queue}
frame_duration_ms = {frame}
# Pace packets to the frame cadence (for sinks that do not pace themselves).
realtime = false
# Drop OpusHead/OpusTags before they reach the sink.
skip_codec_headers = true
verify_checksum = true
# Time tools get to exit after SIGTERM before they are killed.
terminate_grace_ms = {grace}
poll_interval_ms = {poll}
"#,
            path = Self::default_path().display(),
            fetch_program = defaults::FETCH_PROGRAM,
            fetch_args = quoted(defaults::fetch_args()),
            transcode_program = defaults::TRANSCODE_PROGRAM,
            transcode_args = quoted(defaults::transcode_args()),
            sample_rate = defaults::SAMPLE_RATE,
            channels = defaults::CHANNELS,
            bitrate = defaults::BITRATE,
            queue = defaults::QUEUE_CAPACITY,
            frame = defaults::FRAME_DURATION_MS,
            grace = defaults::TERMINATE_GRACE_MS,
            poll = defaults::POLL_INTERVAL_MS,
        )
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxrelay/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxrelay")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_voxrelay_env() {
        remove_env("VOXRELAY_FETCH_PROGRAM");
        remove_env("VOXRELAY_TRANSCODE_PROGRAM");
        remove_env("VOXRELAY_QUEUE_CAPACITY");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.fetch.program, "yt-dlp");
        assert!(config.fetch.args.contains(&"{source}".to_string()));

        assert_eq!(config.transcode.program, "ffmpeg");
        assert_eq!(config.transcode.sample_rate, 48000);
        assert_eq!(config.transcode.channels, 2);
        assert_eq!(config.transcode.bitrate, "96K");

        assert_eq!(config.playback.queue_capacity, 64);
        assert_eq!(config.playback.frame_duration_ms, 20);
        assert!(!config.playback.realtime);
        assert!(config.playback.skip_codec_headers);
        assert!(config.playback.verify_checksum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [fetch]
            program = "/opt/bin/yt-dlp"
            args = ["-q", "-o", "-", "{source}"]

            [transcode]
            program = "ffmpeg"
            sample_rate = 24000
            channels = 1
            bitrate = "64K"

            [playback]
            queue_capacity = 8
            frame_duration_ms = 60
            realtime = true
            skip_codec_headers = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.fetch.program, "/opt/bin/yt-dlp");
        assert_eq!(config.fetch.args, vec!["-q", "-o", "-", "{source}"]);
        assert_eq!(config.transcode.sample_rate, 24000);
        assert_eq!(config.transcode.channels, 1);
        assert_eq!(config.transcode.bitrate, "64K");
        assert_eq!(config.transcode.args, defaults::transcode_args());
        assert_eq!(config.playback.queue_capacity, 8);
        assert_eq!(config.playback.frame_duration(), Duration::from_millis(60));
        assert!(config.playback.realtime);
        assert!(!config.playback.skip_codec_headers);
        assert!(config.playback.verify_checksum);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [playback]
            queue_capacity = 4
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.playback.queue_capacity, 4);
        assert_eq!(config.fetch, FetchConfig::default());
        assert_eq!(config.transcode, TranscodeConfig::default());
        assert_eq!(config.playback.frame_duration_ms, 20);
    }

    #[test]
    fn test_env_override_programs() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxrelay_env();

        set_env("VOXRELAY_FETCH_PROGRAM", "/usr/local/bin/yt-dlp");
        set_env("VOXRELAY_TRANSCODE_PROGRAM", "avconv");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.fetch.program, "/usr/local/bin/yt-dlp");
        assert_eq!(config.transcode.program, "avconv");

        clear_voxrelay_env();
    }

    #[test]
    fn test_env_override_queue_capacity() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxrelay_env();

        set_env("VOXRELAY_QUEUE_CAPACITY", "128");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.playback.queue_capacity, 128);

        set_env("VOXRELAY_QUEUE_CAPACITY", "lots");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.playback.queue_capacity, 64);

        clear_voxrelay_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxrelay_env();

        set_env("VOXRELAY_FETCH_PROGRAM", "");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.fetch.program, "yt-dlp");

        clear_voxrelay_env();
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::default();
        config.playback.queue_capacity = 0;

        match config.validate() {
            Err(RelayError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "playback.queue_capacity");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_program() {
        let mut config = Config::default();
        config.transcode.program = "  ".to_string();

        match config.validate() {
            Err(RelayError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "transcode.program");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [playback
            queue_capacity = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_voxrelay_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_to_toml_round_trips_through_load() {
        let mut config = Config::default();
        config.playback.queue_capacity = 3;
        config.transcode.bitrate = "128K".to_string();

        let rendered = config.to_toml().unwrap();
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(rendered.as_bytes()).unwrap();

        assert_eq!(Config::load(temp_file.path()).unwrap(), config);
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();

        assert!(path_str.contains("voxrelay"));
        assert!(path_str.ends_with("config.toml"));
    }

    #[test]
    fn test_dump_template_parses_to_defaults() {
        let parsed: Config = toml::from_str(&Config::dump_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
