// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest Agent CLI entry point
//!
//! Captures frames and cursor state into an lg-stream region.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use lg_guest_agent::{AgentConfig, CaptureKind, GuestAgent};

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    matches
        .get_one::<String>(name)
        .map(|value| value.parse::<T>().with_context(|| format!("invalid --{name} value {value:?}")))
        .transpose()
}

fn build_config(matches: &ArgMatches) -> anyhow::Result<AgentConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => AgentConfig::from_file(path.as_ref())?,
        None => AgentConfig::default(),
    };

    if let Some(path) = matches.get_one::<String>("shm-path") {
        config.shm_path = PathBuf::from(path);
    }
    if matches.get_flag("create") {
        config.create = true;
    }
    if let Some(size) = parse_arg::<usize>(matches, "region-size")? {
        config.region_size = size;
    }
    if let Some(fps) = parse_arg::<u32>(matches, "fps")? {
        config.target_fps = fps;
    }
    if let Some(width) = parse_arg::<u32>(matches, "width")? {
        config.width = width;
    }
    if let Some(height) = parse_arg::<u32>(matches, "height")? {
        config.height = height;
    }
    if let Some(backend) = matches.get_one::<String>("backend") {
        config.capture = match backend.as_str() {
            "test-pattern" => CaptureKind::TestPattern,
            "x11" => CaptureKind::X11,
            other => bail!("unknown capture backend {other:?}"),
        };
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("lg-guest-agent")
        .version("0.1.0")
        .author("lg-capture Authors")
        .about("Streams captured frames and cursor state into a shared memory region")
        .arg(
            Arg::new("shm-path")
                .short('s')
                .long("shm-path")
                .value_name("PATH")
                .help("Path to the shared memory object [default: /dev/shm/lg-stream]"),
        )
        .arg(
            Arg::new("create")
                .long("create")
                .action(clap::ArgAction::SetTrue)
                .help("Create or grow the shared memory file"),
        )
        .arg(
            Arg::new("region-size")
                .long("region-size")
                .value_name("BYTES")
                .help("Size of the region to create (defaults to what the capture needs)"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .help("Target frames per second [default: 60]"),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_name("BACKEND")
                .help("Capture backend: test-pattern or x11 [default: test-pattern]"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .help("Test pattern width"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .help("Test pattern height"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; command line flags take precedence"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("failed to initialize logging")?;

    let config = build_config(&matches)?;
    info!("Starting lg-guest-agent with config: {config:?}");

    let mut agent = GuestAgent::new(config).context("failed to create guest agent")?;

    // Ctrl+C interrupts a publish blocked on the consumer
    let shutdown = agent.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::Release);
    })
    .context("failed to install Ctrl+C handler")?;

    agent.start()?;
    info!("Guest agent running, press Ctrl+C to stop");

    let result = agent.run();
    match &result {
        Ok(summary) => info!(
            "Published {} frames, skipped {}",
            summary.published, summary.failed
        ),
        Err(e) => error!("Publishing stopped: {e}"),
    }

    info!("Stopping guest agent...");
    agent.stop();

    result?;
    Ok(())
}
