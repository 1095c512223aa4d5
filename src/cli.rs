use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Relay remote audio as Opus packets into a voice sink
#[derive(Parser, Debug)]
#[command(
    name = "voxrelay",
    version = env!("CARGO_PKG_VERSION"),
    about = "Relay remote audio as paced Opus packets"
)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress everything except errors (and the summary)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Parse a duration string. Bare numbers are milliseconds.
///
/// Anything else goes through `humantime`: `500ms`, `2s`, `1m30s`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_queue(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("queue capacity must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch, transcode and relay one source to a local sink (Ctrl+C stops)
    Play {
        /// Source reference handed to the fetch tool (URL, search term, file)
        source: String,

        /// Destination label for the session
        #[arg(long, short = 'd', value_name = "ID", default_value = "local")]
        destination: String,

        /// Write packets to FILE as length-prefixed records instead of discarding them
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,

        /// Pace packets at the frame cadence
        #[arg(long)]
        realtime: bool,

        /// Packet queue capacity (overrides playback.queue_capacity)
        #[arg(long, value_name = "N", value_parser = parse_queue)]
        queue: Option<usize>,

        /// Shutdown grace for the external tools. Examples: 500ms, 2s
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        grace: Option<Duration>,
    },

    /// Print the pages (and optionally packets) of an Ogg stream
    Inspect {
        /// Ogg file to read, or `-` for stdin
        input: PathBuf,

        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,

        /// Also print reassembled packets
        #[arg(long)]
        packets: bool,
    },

    /// Check that the configured tools can be executed
    Check,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the config file location
    Path,
    /// Print the effective configuration (file + environment)
    Show,
    /// Dump a commented configuration template
    Dump,
}
