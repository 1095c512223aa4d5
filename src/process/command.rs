//! Production pipeline: a fetch tool piped into a transcode tool.

use crate::config::Config;
use crate::defaults::SOURCE_PLACEHOLDER;
use crate::error::{RelayError, Result};
use crate::process::group::ProcessGroup;
use crate::process::{LaunchedPipeline, MediaPipeline};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Values substituted into argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub source: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: String,
}

impl TemplateVars {
    pub fn from_config(config: &Config, source: &str) -> Self {
        Self {
            source: source.to_string(),
            sample_rate: config.transcode.sample_rate,
            channels: config.transcode.channels,
            bitrate: config.transcode.bitrate.clone(),
        }
    }

    /// Expands the placeholders in one argument.
    ///
    /// The source is substituted last so that a source reference containing
    /// brace sequences is passed through untouched.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{sample_rate}", &self.sample_rate.to_string())
            .replace("{channels}", &self.channels.to_string())
            .replace("{bitrate}", &self.bitrate)
            .replace(SOURCE_PLACEHOLDER, &self.source)
    }
}

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Name used in logs and errors.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args,
        }
    }

    pub fn render_args(&self, vars: &TemplateVars) -> Vec<String> {
        self.args.iter().map(|arg| vars.render(arg)).collect()
    }

    /// Builds the command with stdout and stderr piped. Stdin is left to the caller.
    pub fn command(&self, vars: &TemplateVars) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(vars))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn spawn(&self, mut command: Command) -> Result<Child> {
        command.spawn().map_err(|e| {
            let message = if e.kind() == std::io::ErrorKind::NotFound {
                format!("{e}. Is {} installed and on PATH?", self.program)
            } else {
                e.to_string()
            };
            RelayError::Launch {
                program: self.program.clone(),
                message,
            }
        })
    }
}

/// Chains the fetch tool's stdout into the transcode tool's stdin and hands
/// out the transcoder's stdout.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    fetch: CommandSpec,
    transcode: CommandSpec,
    vars: TemplateVars,
    grace: Duration,
    poll_interval: Duration,
}

impl CommandPipeline {
    pub fn new(fetch: CommandSpec, transcode: CommandSpec) -> Self {
        let config = Config::default();
        Self {
            fetch,
            transcode,
            vars: TemplateVars::from_config(&config, ""),
            grace: config.playback.terminate_grace(),
            poll_interval: config.playback.poll_interval(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch: CommandSpec::new("fetch", &config.fetch.program, config.fetch.args.clone()),
            transcode: CommandSpec::new(
                "transcode",
                &config.transcode.program,
                config.transcode.args.clone(),
            ),
            vars: TemplateVars::from_config(config, ""),
            grace: config.playback.terminate_grace(),
            poll_interval: config.playback.poll_interval(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn fetch(&self) -> &CommandSpec {
        &self.fetch
    }

    pub fn transcode(&self) -> &CommandSpec {
        &self.transcode
    }
}

impl MediaPipeline for CommandPipeline {
    fn launch(&self, source: &str) -> Result<LaunchedPipeline> {
        let vars = TemplateVars {
            source: source.to_string(),
            ..self.vars.clone()
        };

        let mut fetch_command = self.fetch.command(&vars);
        fetch_command.stdin(Stdio::null());
        let mut fetch = self.fetch.spawn(fetch_command)?;

        let Some(fetch_stdout) = fetch.stdout.take() else {
            abandon(&mut fetch, &self.fetch.label);
            return Err(RelayError::Launch {
                program: self.fetch.program.clone(),
                message: "stdout was not captured".to_string(),
            });
        };

        let mut transcode_command = self.transcode.command(&vars);
        transcode_command.stdin(Stdio::from(fetch_stdout));
        let mut transcode = match self.transcode.spawn(transcode_command) {
            Ok(child) => child,
            Err(e) => {
                abandon(&mut fetch, &self.fetch.label);
                return Err(e);
            }
        };

        let Some(output) = transcode.stdout.take() else {
            abandon(&mut transcode, &self.transcode.label);
            abandon(&mut fetch, &self.fetch.label);
            return Err(RelayError::Launch {
                program: self.transcode.program.clone(),
                message: "stdout was not captured".to_string(),
            });
        };

        tracing::info!(
            fetch = %self.fetch.program,
            fetch_pid = fetch.id(),
            transcode = %self.transcode.program,
            transcode_pid = transcode.id(),
            "pipeline started"
        );

        let group = ProcessGroup::start(
            vec![
                (self.fetch.label.clone(), fetch),
                (self.transcode.label.clone(), transcode),
            ],
            self.grace,
            self.poll_interval,
        );

        Ok(LaunchedPipeline {
            output: Box::new(output),
            control: Arc::new(group),
        })
    }
}

/// Kills and reaps a child that will never be handed to a group.
fn abandon(child: &mut Child, label: &str) {
    if let Err(e) = child.kill() {
        tracing::debug!(process = label, error = %e, "kill failed");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(process = label, error = %e, "failed to reap child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn vars(source: &str) -> TemplateVars {
        TemplateVars::from_config(&Config::default(), source)
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let vars = vars("https://example.com/watch?v=abc");
        assert_eq!(vars.render("{source}"), "https://example.com/watch?v=abc");
        assert_eq!(vars.render("-ar={sample_rate}"), "-ar=48000");
        assert_eq!(vars.render("{channels}ch@{bitrate}"), "2ch@96K");
        assert_eq!(vars.render("-"), "-");
    }

    #[test]
    fn render_does_not_expand_placeholders_inside_the_source() {
        let vars = vars("weird{bitrate}name");
        assert_eq!(vars.render("{source}"), "weird{bitrate}name");
    }

    #[test]
    fn default_pipeline_renders_expected_arguments() {
        let pipeline = CommandPipeline::from_config(&Config::default());
        let vars = vars("song");

        assert_eq!(pipeline.fetch().program, "yt-dlp");
        assert_eq!(
            pipeline.fetch().render_args(&vars),
            vec!["-o", "-", "-f", "bestaudio", "song"]
        );
        let transcode_args = pipeline.transcode().render_args(&vars);
        assert!(transcode_args.windows(2).any(|w| w == ["-ar", "48000"]));
        assert!(transcode_args.windows(2).any(|w| w == ["-b:a", "96K"]));
        assert!(transcode_args.windows(2).any(|w| w == ["-ac", "2"]));
    }

    #[test]
    fn missing_fetch_program_is_a_launch_error() {
        let pipeline = CommandPipeline::new(
            CommandSpec::new("fetch", "voxrelay-no-such-fetch-tool", vec![]),
            CommandSpec::new("transcode", "cat", vec![]),
        );
        let err = pipeline.launch("anything").err().unwrap();
        assert_eq!(err.kind(), FailureKind::Launch);
        assert!(err.to_string().contains("voxrelay-no-such-fetch-tool"));
    }

    #[cfg(unix)]
    #[test]
    fn missing_transcode_program_is_a_launch_error() {
        let pipeline = CommandPipeline::new(
            CommandSpec::new("fetch", "sleep", vec!["30".to_string()]),
            CommandSpec::new("transcode", "voxrelay-no-such-transcoder", vec![]),
        );
        let started = std::time::Instant::now();
        let err = pipeline.launch("anything").err().unwrap();
        assert_eq!(err.kind(), FailureKind::Launch);
        assert!(err.to_string().contains("voxrelay-no-such-transcoder"));
        // The already running fetch process was killed rather than awaited.
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
