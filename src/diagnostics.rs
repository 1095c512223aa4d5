//! Tool availability checks.
//!
//! Verifies that the configured fetch and transcode tools can be executed.

use crate::config::Config;
use owo_colors::OwoColorize;
use std::path::Path;
use std::process::{Command, Stdio};

/// Result of a dependency check.
#[derive(Debug, PartialEq)]
pub enum CheckResult {
    /// Tool is installed and working, with the first line of its version output
    Ok(String),
    /// Tool is not found
    NotFound,
    /// Tool is found but misbehaves
    Warning(String),
}

/// Flag that prints a version banner. The ffmpeg family uses a single dash.
fn version_flag(program: &str) -> &'static str {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    if name.starts_with("ffmpeg") || name.starts_with("ffprobe") || name.starts_with("avconv") {
        "-version"
    } else {
        "--version"
    }
}

/// Check if a command exists and is executable.
pub fn check_command(program: &str) -> CheckResult {
    match Command::new(program)
        .arg(version_flag(program))
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            CheckResult::Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
        }
        Ok(output) => CheckResult::Warning(format!(
            "'{}' found but {} failed ({})",
            program,
            version_flag(program),
            output.status
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckResult::NotFound,
        Err(e) => CheckResult::Warning(format!("Error checking '{}': {}", program, e)),
    }
}

fn install_hint(program: &str) -> Option<&'static str> {
    match Path::new(program).file_name()?.to_str()? {
        "yt-dlp" => Some("pipx install yt-dlp   (or: sudo apt install yt-dlp)"),
        "ffmpeg" => Some("sudo apt install ffmpeg  (Debian/Ubuntu)\n           sudo pacman -S ffmpeg    (Arch)"),
        _ => None,
    }
}

fn report(label: &str, program: &str) -> bool {
    print!("{label} ({program}): ");
    match check_command(program) {
        CheckResult::Ok(version) => {
            if version.is_empty() {
                println!("{}", "✓ OK".green());
            } else {
                println!("{} {}", "✓ OK".green(), version.dimmed());
            }
            true
        }
        CheckResult::NotFound => {
            println!("{}", "✗ NOT FOUND".red());
            if let Some(hint) = install_hint(program) {
                println!("  Install: {hint}");
            }
            false
        }
        CheckResult::Warning(msg) => {
            println!("{} {}", "⚠ WARNING:".yellow(), msg);
            false
        }
    }
}

/// Run all checks and print results. Returns true when playback can work.
pub fn check_dependencies(config: &Config) -> bool {
    println!("Checking relay dependencies...\n");

    let config_ok = match config.validate() {
        Ok(()) => {
            println!("configuration: {}", "✓ OK".green());
            true
        }
        Err(e) => {
            println!("configuration: {} {}", "✗".red(), e);
            false
        }
    };
    let fetch_ok = report("fetch", &config.fetch.program);
    let transcode_ok = report("transcode", &config.transcode.program);

    println!();
    let ready = config_ok && fetch_ok && transcode_ok;
    if ready {
        println!("{}", "✓ Ready to relay.".green());
    } else {
        println!("{}", "⚠ Playback will fail until the problems above are fixed.".yellow());
    }
    ready
}
