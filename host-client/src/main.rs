// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host Client CLI entry point
//!
//! Attaches to an lg-stream region and presents frames into an offscreen
//! renderer, reconnecting whenever the producer restarts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use log::{debug, error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use lg_host_client::{
    ClientConfig, HeadlessRenderer, SessionError, SessionState, StreamSession, TickOutcome,
};
use lg_stream_protocol::QueueError;

/// Delay between attach attempts while no producer is running
const ATTACH_RETRY: Duration = Duration::from_millis(500);

/// Presented frames between progress lines
const REPORT_EVERY: u64 = 600;

fn build_config(matches: &ArgMatches) -> anyhow::Result<ClientConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ClientConfig::from_file(path.as_ref())?,
        None => ClientConfig::default(),
    };

    if let Some(path) = matches.get_one::<String>("shm-path") {
        config.shm_path = PathBuf::from(path);
    }
    if let Some(rate) = matches.get_one::<String>("tick-rate") {
        config.tick_rate = rate
            .parse()
            .with_context(|| format!("invalid --tick-rate value {rate:?}"))?;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("lg-host-client")
        .version("0.1.0")
        .author("lg-capture Authors")
        .about("Presents frames and cursor state from a shared memory region")
        .arg(
            Arg::new("shm-path")
                .short('s')
                .long("shm-path")
                .value_name("PATH")
                .help("Path to the shared memory object [default: /dev/shm/lg-stream]"),
        )
        .arg(
            Arg::new("tick-rate")
                .short('r')
                .long("tick-rate")
                .value_name("HZ")
                .help("Render ticks per second [default: 60]"),
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
    info!("Starting lg-host-client with config: {config:?}");
    let tick_interval = config.tick_interval();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Release);
        })
        .context("failed to install Ctrl+C handler")?;
    }

    let mut session = StreamSession::new(config);
    let mut renderer = HeadlessRenderer::new();
    let mut presented: u64 = 0;
    let mut waiting_logged = false;

    while !shutdown.load(Ordering::Acquire) {
        let started = Instant::now();

        match session.state() {
            SessionState::Stopped => match session.open() {
                Ok(()) => waiting_logged = false,
                Err(e @ SessionError::Queue(QueueError::ProtocolMismatch { .. })) => {
                    return Err(e.into());
                }
                Err(e) => {
                    if !waiting_logged {
                        info!("Waiting for a producer: {e}");
                        waiting_logged = true;
                    }
                    thread::sleep(ATTACH_RETRY);
                    continue;
                }
            },
            SessionState::Open => {
                if let Err(e) = session.start() {
                    warn!("Failed to start stream session: {e}");
                }
            }
            SessionState::Running => match session.video_tick(&mut renderer) {
                Ok(TickOutcome::Presented { width, height, .. }) => {
                    presented += 1;
                    if presented % REPORT_EVERY == 0 {
                        info!("Presented {presented} frames ({width}x{height})");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Frame not presented: {e}"),
            },
            SessionState::Starting | SessionState::Stopping => {
                warn!("Stream session stopped, reconnecting");
                session.release_surfaces(&mut renderer);
                session.deinitialize();
            }
        }

        // Maintain tick rate
        let elapsed = started.elapsed();
        if elapsed < tick_interval {
            thread::sleep(tick_interval - elapsed);
        }
    }

    info!("Stopping host client...");
    session.release_surfaces(&mut renderer);
    session.deinitialize();
    debug!("Renderer stats: {:?}", renderer.stats());

    if renderer.surface_count() != 0 || renderer.cursor_count() != 0 {
        error!("Renderer objects leaked on shutdown");
    }
    Ok(())
}
