use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use voxrelay::cli::{Cli, Commands, ConfigAction};
use voxrelay::config::Config;
use voxrelay::diagnostics::check_dependencies;
use voxrelay::logging::init_tracing;
use voxrelay::ogg::{Demuxer, Page};
use voxrelay::relay::{
    DestinationId, MediaRequest, NullSink, PacketFileSink, PlaybackReport, Reassembler, Session,
    SessionRegistry, VoiceSink,
};
use voxrelay::{CommandPipeline, Packet};

/// Overrides from `voxrelay play` flags.
struct PlayOptions {
    source: String,
    destination: String,
    output: Option<PathBuf>,
    realtime: bool,
    queue: Option<usize>,
    grace: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Play {
            source,
            destination,
            output,
            realtime,
            queue,
            grace,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = PlayOptions {
                source,
                destination,
                output,
                realtime,
                queue,
                grace,
            };
            run_play(config, options, cli.quiet).await?;
        }
        Commands::Inspect {
            input,
            json,
            packets,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_inspect(&input, json, packets, config.playback.verify_checksum)?;
        }
        Commands::Check => {
            let config = Config::load_or_default(&config_path(cli.config.as_deref()))?
                .with_env_overrides();
            if !check_dependencies(&config) {
                std::process::exit(1);
            }
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "voxrelay", &mut io::stdout());
        }
    }

    Ok(())
}

fn config_path(custom: Option<&Path>) -> PathBuf {
    custom
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Load, apply environment overrides and validate.
fn load_config(custom: Option<&Path>) -> Result<Config> {
    let config = Config::load_or_default(&config_path(custom))?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run_play(mut config: Config, options: PlayOptions, quiet: bool) -> Result<()> {
    if options.realtime {
        config.playback.realtime = true;
    }
    if let Some(queue) = options.queue {
        config.playback.queue_capacity = queue;
    }
    if let Some(grace) = options.grace {
        config.playback.terminate_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
    }
    config.validate()?;

    let pipeline = CommandPipeline::from_config(&config);
    let output = options.output.clone();
    let gateway = move |destination: &DestinationId| -> voxrelay::Result<Box<dyn VoiceSink>> {
        match &output {
            Some(path) => {
                tracing::info!(%destination, path = %path.display(), "writing packets to file");
                Ok(Box::new(PacketFileSink::create(path)?))
            }
            None => Ok(Box::new(NullSink)),
        }
    };

    let session = Session::new(Arc::new(pipeline), Arc::new(gateway), config.playback.clone());
    let registry = SessionRegistry::new(session);
    let handle = registry.play(MediaRequest::new(options.source, options.destination.as_str()))?;
    let cancel = handle.cancel_token().clone();

    if !quiet {
        eprintln!(
            "{} {} {}",
            "Playing".green(),
            handle.destination().bold(),
            "(Ctrl+C to stop)".dimmed()
        );
    }

    let mut finished = tokio::task::spawn_blocking(move || handle.wait());
    let outcome = tokio::select! {
        outcome = &mut finished => outcome,
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("{}", "Stopping...".yellow());
            }
            cancel.cancel();
            finished.await
        }
    };
    let report = outcome.context("session thread panicked")??;

    print_summary(&report, options.output.as_deref());
    Ok(())
}

fn print_summary(report: &PlaybackReport, output: Option<&Path>) {
    let millis = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
    let elapsed = Duration::from_millis(millis);
    let status = if report.cancelled {
        format!("{}", "cancelled".yellow())
    } else {
        format!("{}", report.state.green())
    };
    println!(
        "{}: {} packets, {} pages in {} ({})",
        report.destination.bold(),
        report.packets_sent,
        report.pages_read,
        humantime::format_duration(elapsed),
        status
    );
    if report.headers_skipped > 0 {
        println!("  {} codec header packets skipped", report.headers_skipped);
    }
    if let Some(path) = output {
        println!("  packets written to {}", path.display());
    }
}

fn open_input(input: &Path) -> Result<Box<dyn Read>> {
    if input == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn page_flags(page: &Page) -> String {
    let mut flags = String::new();
    if page.continued {
        flags.push('c');
    }
    if page.first {
        flags.push('b');
    }
    if page.last {
        flags.push('e');
    }
    if flags.is_empty() {
        flags.push('-');
    }
    flags
}

fn run_inspect(input: &Path, json: bool, show_packets: bool, verify: bool) -> Result<()> {
    let mut demuxer = Demuxer::new(open_input(input)?).with_checksum_verification(verify);
    let mut reassembler = Reassembler::new();

    while let Some(page) = demuxer.next_page()? {
        if json {
            let line = serde_json::json!({
                "type": "page",
                "sequence": page.sequence,
                "serial": page.serial,
                "granule_position": page.granule_position,
                "continued": page.continued,
                "first": page.first,
                "last": page.last,
                "segments": page.lacing()?.len(),
                "body_len": page.body_len(),
            });
            println!("{line}");
        } else {
            println!(
                "page {:>6}  serial {:08x}  granule {:>12}  flags {:<3}  fragments {:>3}  bytes {:>6}",
                page.sequence,
                page.serial,
                page.granule_position,
                page_flags(&page),
                page.fragments.len(),
                page.body_len()
            );
        }

        if show_packets {
            for packet in reassembler.push(page)? {
                print_packet(&packet, json);
            }
        }
    }

    if show_packets && let Some(packet) = reassembler.finish() {
        print_packet(&packet, json);
    }

    if !json {
        let serial = demuxer
            .serial()
            .map(|s| format!("{s:08x}"))
            .unwrap_or_else(|| "none".to_string());
        println!();
        println!(
            "{} pages, serial {}, {} foreign pages skipped",
            demuxer.pages(),
            serial,
            demuxer.foreign_pages()
        );
        if show_packets {
            println!("{} packets", reassembler.packets_emitted());
        }
    }
    Ok(())
}

fn print_packet(packet: &Packet, json: bool) {
    if json {
        let line = serde_json::json!({
            "type": "packet",
            "index": packet.index,
            "len": packet.len(),
        });
        println!("{line}");
    } else {
        let preview: String = packet
            .data
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect();
        println!("  packet {:>6}  {:>5} bytes  {}", packet.index, packet.len(), preview.dimmed());
    }
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let path = config_path(custom_path);

    match action {
        ConfigAction::Path => {
            let exists = if path.exists() {
                "".to_string()
            } else {
                format!(" {}", "(not created, defaults in use)".dimmed())
            };
            println!("{}{}", path.display(), exists);
        }
        ConfigAction::Show => {
            let config = Config::load_or_default(&path)?.with_env_overrides();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Dump => {
            print!("{}", Config::dump_template());
        }
    }
    Ok(())
}
