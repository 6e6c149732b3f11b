// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest Agent main implementation
//!
//! Owns the shared region and the producer session, publishes frames from
//! the caller's loop and runs the cursor publisher on its own thread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use lg_stream_protocol::{FrameSlotLayout, ProducerSession, QueueError, RegionError, SharedRegion};

use crate::capture::stub::TestPatternCapture;
use crate::capture::CaptureBackend;
use crate::cursor::stub_cursor::StubCursorSource;
use crate::cursor::CursorSource;
use crate::pointer::{CursorPosition, CursorPublisher};
use crate::publisher::{FramePublisher, PublishError, PublishedFrame};

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Session error: {0}")]
    Session(#[from] QueueError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Backend initialization failed: {0}")]
    Backend(#[source] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Agent already running")]
    AlreadyRunning,
}

impl AgentError {
    /// True for errors after which the frame loop cannot continue
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Publish(e) => e.is_fatal(),
            _ => true,
        }
    }
}

/// Frame loop totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Frames published
    pub published: u64,
    /// Iterations that failed without stopping the loop
    pub failed: u64,
}

/// Capture backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureKind {
    /// Synthetic gradient, no display needed
    TestPattern,
    /// X11 root window
    X11,
}

/// Guest Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Shared memory path
    pub shm_path: PathBuf,
    /// Create (or grow) the shared memory file instead of requiring it
    pub create: bool,
    /// Region size to create; 0 sizes it for the capture backend
    pub region_size: usize,
    /// Target frame rate
    pub target_fps: u32,
    /// Cursor poll interval in milliseconds
    pub cursor_poll_ms: u64,
    /// Capture backend
    pub capture: CaptureKind,
    /// Test pattern width
    pub width: u32,
    /// Test pattern height
    pub height: u32,
    /// Seconds a stalled consumer is waited for between warnings
    pub stall_warning_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shm_path: PathBuf::from("/dev/shm/lg-stream"),
            create: false,
            region_size: 0,
            target_fps: 60,
            cursor_poll_ms: 4,
            capture: CaptureKind::TestPattern,
            width: 1280,
            height: 720,
            stall_warning_secs: 10,
        }
    }
}

impl AgentConfig {
    /// Load from a JSON file; absent keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let text = fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.target_fps == 0 {
            return Err(AgentError::Config("target_fps cannot be zero".to_string()));
        }
        if self.capture == CaptureKind::TestPattern && (self.width == 0 || self.height == 0) {
            return Err(AgentError::Config(format!(
                "test pattern size {}x{} is empty",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Frame interval derived from the target frame rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.target_fps.max(1)))
    }

    fn capture_backend(&self) -> Result<Box<dyn CaptureBackend>, AgentError> {
        match self.capture {
            CaptureKind::TestPattern => Ok(Box::new(TestPatternCapture::new(self.width, self.height))),
            #[cfg(all(target_os = "linux", feature = "x11"))]
            CaptureKind::X11 => Ok(Box::new(
                crate::capture::x11::X11Capture::new().map_err(AgentError::Backend)?,
            )),
            #[cfg(not(all(target_os = "linux", feature = "x11")))]
            CaptureKind::X11 => Err(AgentError::Config(
                "X11 capture is not available in this build".to_string(),
            )),
        }
    }

    fn cursor_source(&self) -> Result<Box<dyn CursorSource>, AgentError> {
        match self.capture {
            #[cfg(all(target_os = "linux", feature = "x11"))]
            CaptureKind::X11 => Ok(Box::new(
                crate::cursor::x11_cursor::X11CursorSource::new().map_err(AgentError::Backend)?,
            )),
            _ => Ok(Box::new(StubCursorSource::new(self.width, self.height))),
        }
    }
}

/// Guest Agent
pub struct GuestAgent {
    /// Configuration
    config: AgentConfig,
    /// Frame capture backend
    capture: Box<dyn CaptureBackend>,
    /// Cursor source, moved into the cursor thread on start
    cursor_source: Option<Box<dyn CursorSource>>,
    /// Frame publisher
    publisher: FramePublisher,
    /// Producer session
    session: Arc<ProducerSession>,
    /// Latest pointer position
    cursor_position: Arc<CursorPosition>,
    /// Shutdown flag, shared with the publisher and cursor thread
    shutdown: Arc<AtomicBool>,
    /// Cursor thread handle
    cursor_thread: Option<thread::JoinHandle<()>>,
    /// Frames published
    frame_count: u64,
    /// Set once `stop` has run
    stopped: bool,
    /// Shared region, dropped last
    region: SharedRegion,
}

impl GuestAgent {
    /// Create a new Guest Agent with the backends named by `config`
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let capture = config.capture_backend()?;
        let cursor = config.cursor_source()?;
        Self::with_backends(config, capture, cursor)
    }

    /// Create a Guest Agent with explicit backends
    pub fn with_backends(
        config: AgentConfig,
        capture: Box<dyn CaptureBackend>,
        cursor_source: Box<dyn CursorSource>,
    ) -> Result<Self, AgentError> {
        let max_frame_size = capture.max_frame_size();
        let min_size = SharedRegion::required_size(FrameSlotLayout::min_region_size(max_frame_size));

        let region = if config.create {
            SharedRegion::create(&config.shm_path, config.region_size.max(min_size))?
        } else {
            let mut region = SharedRegion::new(&config.shm_path).with_min_size(min_size);
            region.initialize()?;
            region
        };

        let session = Arc::new(ProducerSession::initialize(region.view()?)?);
        let cursor_position = Arc::new(CursorPosition::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let publisher = FramePublisher::new(
            session.clone(),
            max_frame_size,
            cursor_position.clone(),
            shutdown.clone(),
        )?
        .with_stall_warning(Duration::from_secs(config.stall_warning_secs.max(1)));
        publisher.layout().validate().map_err(PublishError::from)?;

        info!(
            "Guest agent on {} with {} capture ({max_frame_size} byte frames)",
            config.shm_path.display(),
            capture.name()
        );

        Ok(Self {
            config,
            capture,
            cursor_source: Some(cursor_source),
            publisher,
            session,
            cursor_position,
            shutdown,
            cursor_thread: None,
            frame_count: 0,
            stopped: false,
            region,
        })
    }

    /// Start the cursor thread
    pub fn start(&mut self) -> Result<(), AgentError> {
        let mut source = self.cursor_source.take().ok_or(AgentError::AlreadyRunning)?;
        let mut cursor = CursorPublisher::new(self.session.clone(), self.cursor_position.clone());
        let shutdown = self.shutdown.clone();
        let interval = Duration::from_millis(self.config.cursor_poll_ms.max(1));

        let handle = thread::Builder::new()
            .name("lg-cursor".to_string())
            .spawn(move || {
                let mut failing = false;
                while !shutdown.load(Ordering::Acquire) {
                    match cursor.poll(source.as_mut()) {
                        Ok(_) => failing = false,
                        Err(e) if failing => debug!("Cursor update failed: {e}"),
                        Err(e) => {
                            warn!("Cursor update failed: {e}");
                            failing = true;
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(AgentError::Backend)?;
        self.cursor_thread = Some(handle);

        info!("Guest agent started");
        Ok(())
    }

    /// Capture and publish one frame
    pub fn run_iteration(&mut self) -> Result<PublishedFrame, AgentError> {
        let published = self.publisher.publish_frame(self.capture.as_mut())?;
        self.frame_count += 1;
        debug!(
            "Published frame {} in slot {} ({} bytes)",
            published.message, published.slot, published.descriptor.data_length
        );
        Ok(published)
    }

    /// Publish frames at the configured rate until shutdown is requested.
    /// Returns the loop totals once the shutdown flag is set.
    ///
    /// Non-fatal errors skip the frame; only the first of a run of them is
    /// logged as a warning. A fatal error ends the loop and is returned.
    pub fn run(&mut self) -> Result<RunSummary, AgentError> {
        let frame_interval = self.config.frame_interval();
        let mut summary = RunSummary::default();
        let mut failing = false;

        while !self.shutdown.load(Ordering::Acquire) {
            let started = Instant::now();

            match self.run_iteration() {
                Ok(_) => {
                    summary.published += 1;
                    if failing {
                        info!("Publishing resumed");
                        failing = false;
                    }
                }
                Err(AgentError::Publish(PublishError::Shutdown)) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    summary.failed += 1;
                    if failing {
                        debug!("Frame skipped: {e}");
                    } else {
                        warn!("Frame skipped: {e}");
                        failing = true;
                    }
                }
            }

            // Maintain frame rate
            let elapsed = started.elapsed();
            if elapsed < frame_interval {
                thread::sleep(frame_interval - elapsed);
            }
        }

        Ok(summary)
    }

    /// Flag that interrupts a blocked publish and stops the cursor thread
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Stop the guest agent. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(handle) = self.cursor_thread.take() {
            if handle.join().is_err() {
                warn!("Cursor thread panicked");
            }
        }
        self.capture.shutdown();
        info!("Guest agent stopped after {} frames", self.frame_count);
    }

    /// Check if the agent is running
    pub fn is_running(&self) -> bool {
        self.cursor_thread.is_some() && !self.shutdown.load(Ordering::Acquire)
    }

    /// Frames published so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Current session ID
    pub fn session_id(&self) -> u32 {
        self.session.session_id()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Local peer ID
    pub fn peer_id(&self) -> Result<u32, AgentError> {
        Ok(self.region.peer_id()?)
    }
}

impl Drop for GuestAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.target_fps, 60);
        assert_eq!(config.capture, CaptureKind::TestPattern);
        assert!(!config.create);
        assert_eq!(config.frame_interval(), Duration::from_micros(16_666));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_partial_json() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"shm_path": "/tmp/x", "capture": "x11", "target_fps": 30}"#)
                .unwrap();
        assert_eq!(config.shm_path, PathBuf::from("/tmp/x"));
        assert_eq!(config.capture, CaptureKind::X11);
        assert_eq!(config.target_fps, 30);
        assert_eq!(config.width, AgentConfig::default().width);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(&path, r#"{"width": 64, "height": 32, "create": true}"#).unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!((config.width, config.height), (64, 32));
        assert!(config.create);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AgentConfig::from_file(&path), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_config_validation() {
        let zero_fps = AgentConfig {
            target_fps: 0,
            ..Default::default()
        };
        assert!(matches!(zero_fps.validate(), Err(AgentError::Config(_))));

        let empty = AgentConfig {
            width: 0,
            ..Default::default()
        };
        assert!(matches!(empty.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_agent_creates_region() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            shm_path: dir.path().join("region"),
            create: true,
            width: 32,
            height: 16,
            ..Default::default()
        };

        let mut agent = GuestAgent::new(config).unwrap();
        assert_eq!(agent.session_id(), 1);
        assert_ne!(agent.peer_id().unwrap(), 0);
        assert!(!agent.is_running());

        agent.start().unwrap();
        assert!(agent.is_running());
        assert!(matches!(agent.start(), Err(AgentError::AlreadyRunning)));

        agent.stop();
        agent.stop();
        assert!(!agent.is_running());
    }

    #[test]
    fn test_error_severity() {
        let capacity = AgentError::Publish(PublishError::Capacity(
            FrameSlotLayout::new(0, 64).data_offset(0).unwrap_err(),
        ));
        assert!(!capacity.is_fatal());
        assert!(!AgentError::Publish(PublishError::Capture(io::Error::other("lost"))).is_fatal());
        assert!(AgentError::Publish(PublishError::Shutdown).is_fatal());
        assert!(AgentError::Config("bad".to_string()).is_fatal());
    }

    #[test]
    fn test_agent_requires_existing_region() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            shm_path: dir.path().join("missing"),
            ..Default::default()
        };
        assert!(matches!(
            GuestAgent::new(config),
            Err(AgentError::Region(RegionError::NotFound(_)))
        ));
    }
}
