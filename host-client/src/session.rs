// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Consumer session
//!
//! Owns the region mapping, the queue client, both subscriptions and the
//! worker threads, and moves through
//! `Stopped -> Open -> Starting -> Running -> Stopping -> Stopped`.
//!
//! The frame worker (`lg-frame`) keeps the frame stream drained to its
//! newest message under the frame gate; the pointer worker (`lg-pointer`)
//! applies cursor messages in order. A worker that hits a queue error other
//! than [`QueueError::Empty`] moves the session to `Stopping`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use lg_stream_protocol::{
    CursorFlags, QueueClient, QueueError, RegionError, RegionEvent, SharedRegion, StreamId,
    Subscription, WaitStatus, SESSION_VERSION,
};

use crate::cursor::CursorState;
use crate::present::{PresentError, Presenter, TickContext, TickOutcome};
use crate::render::RenderBackend;
use crate::sync::Semaphore;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Presentation error: {0}")]
    Present(#[from] PresentError),

    #[error("Cannot {action} a session that is {state:?}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Session lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing mapped
    Stopped = 0,
    /// Region mapped and session descriptor validated
    Open = 1,
    /// Subscribing to the streams
    Starting = 2,
    /// Workers running, ticks present frames
    Running = 3,
    /// A worker failed or a stop was requested
    Stopping = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Open,
            2 => SessionState::Starting,
            3 => SessionState::Running,
            4 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }
}

/// Host client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Shared memory path
    pub shm_path: PathBuf,
    /// Render ticks per second
    pub tick_rate: u32,
    /// Longest a render tick waits for the frame gate, in milliseconds
    pub gate_timeout_ms: u64,
    /// Longest a worker sleeps on its doorbell, in milliseconds
    pub worker_wait_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shm_path: PathBuf::from("/dev/shm/lg-stream"),
            tick_rate: 60,
            gate_timeout_ms: 5,
            worker_wait_ms: 100,
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file; absent keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.tick_rate == 0 {
            return Err(SessionError::Config("tick_rate cannot be zero".to_string()));
        }
        if self.worker_wait_ms == 0 {
            return Err(SessionError::Config("worker_wait_ms cannot be zero".to_string()));
        }
        Ok(())
    }

    /// Render tick interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick_rate.max(1)))
    }

    fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    fn worker_wait(&self) -> Duration {
        Duration::from_millis(self.worker_wait_ms.max(1))
    }
}

/// State shared with the workers
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    gate: Semaphore,
    cursor: CursorState,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Consumer side of an lg-stream region
pub struct StreamSession {
    config: ClientConfig,
    shared: Arc<Shared>,
    presenter: Presenter,
    frames: Option<Arc<Subscription>>,
    pointer: Option<Arc<Subscription>>,
    workers: Vec<JoinHandle<()>>,
    client: Option<QueueClient>,
    region: Option<SharedRegion>,
}

impl StreamSession {
    pub fn new(config: ClientConfig) -> Self {
        let presenter = Presenter::new(config.gate_timeout());
        Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SessionState::Stopped as u8),
                gate: Semaphore::new(1),
                cursor: CursorState::new(),
            }),
            presenter,
            frames: None,
            pointer: None,
            workers: Vec::new(),
            client: None,
            region: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cursor(&self) -> &CursorState {
        &self.shared.cursor
    }

    pub fn presenter(&self) -> &Presenter {
        &self.presenter
    }

    /// Producer session this client is attached to
    pub fn session_id(&self) -> Option<u32> {
        self.client.as_ref().map(QueueClient::session_id)
    }

    /// Map the region and validate the session descriptor.
    ///
    /// On failure nothing stays mapped and the session remains `Stopped`.
    pub fn open(&mut self) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Stopped {
            return Err(SessionError::InvalidState {
                action: "open",
                state,
            });
        }
        self.config.validate()?;

        let mut region = SharedRegion::new(&self.config.shm_path);
        region.initialize()?;
        let client = match QueueClient::attach(region.view()?) {
            Ok(client) => client,
            Err(e @ QueueError::ProtocolMismatch { .. }) => {
                error!("The producer is not compatible with this client (expected version {SESSION_VERSION}): {e}");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Opened {} as consumer {} of session {}",
            self.config.shm_path.display(),
            region.peer_id()?,
            client.session_id()
        );
        self.client = Some(client);
        self.region = Some(region);
        self.shared.set(SessionState::Open);
        Ok(())
    }

    /// Subscribe to both streams and start the workers
    pub fn start(&mut self) -> Result<(), SessionError> {
        if !self.shared.transition(SessionState::Open, SessionState::Starting) {
            return Err(SessionError::InvalidState {
                action: "start",
                state: self.state(),
            });
        }

        match self.spawn_workers() {
            Ok(()) => {
                info!("Stream session running");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start stream session: {e}");
                self.shared.set(SessionState::Stopping);
                Err(e)
            }
        }
    }

    fn spawn_workers(&mut self) -> Result<(), SessionError> {
        let (Some(client), Some(region)) = (&self.client, &self.region) else {
            return Err(SessionError::InvalidState {
                action: "start",
                state: self.state(),
            });
        };

        let frames = Arc::new(client.subscribe(StreamId::Frame)?);
        let pointer = Arc::new(client.subscribe(StreamId::Pointer)?);
        let frame_event = region.create_event(StreamId::Frame.channel())?;
        let pointer_event = region.create_event(StreamId::Pointer.channel())?;
        let wait = self.config.worker_wait();

        self.frames = Some(frames.clone());
        self.pointer = Some(pointer.clone());
        self.shared.set(SessionState::Running);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("lg-frame".to_string())
            .spawn(move || frame_worker(&shared, &frames, frame_event, wait))
            .map_err(SessionError::Spawn)?;
        self.workers.push(handle);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("lg-pointer".to_string())
            .spawn(move || pointer_worker(&shared, &pointer, pointer_event, wait))
            .map_err(SessionError::Spawn)?;
        self.workers.push(handle);

        Ok(())
    }

    /// Present the newest frame. A no-op unless the session is running.
    pub fn video_tick(&mut self, renderer: &mut dyn RenderBackend) -> Result<TickOutcome, SessionError> {
        if self.shared.state() != SessionState::Running {
            return Ok(TickOutcome::Idle);
        }
        let Some(frames) = self.frames.as_deref() else {
            return Ok(TickOutcome::Idle);
        };

        let shared = &*self.shared;
        let running = || shared.state() == SessionState::Running;
        let ctx = TickContext {
            frames,
            gate: &shared.gate,
            cursor: &shared.cursor,
            running: &running,
        };

        match self.presenter.tick(&ctx, renderer) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_fatal() {
                    error!("Frame stream failed: {e}");
                    shared.transition(SessionState::Running, SessionState::Stopping);
                }
                Err(e.into())
            }
        }
    }

    /// Destroy the renderer objects the presenter created
    pub fn release_surfaces(&mut self, renderer: &mut dyn RenderBackend) {
        self.presenter.release(renderer);
    }

    /// Stop the workers and drop the subscriptions. The region stays mapped
    /// and the session returns to `Open`. Idempotent.
    pub fn stop(&mut self) {
        match self.state() {
            SessionState::Stopped | SessionState::Open => return,
            _ => self.shared.set(SessionState::Stopping),
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Stream worker panicked");
            }
        }
        self.frames = None;
        self.pointer = None;

        self.shared.set(SessionState::Open);
        debug!("Stream session stopped");
    }

    /// Stop, detach and unmap. Idempotent.
    pub fn deinitialize(&mut self) {
        self.stop();
        self.client = None;
        if let Some(mut region) = self.region.take() {
            region.deinitialize();
            info!("Released {}", self.config.shm_path.display());
        }
        self.shared.set(SessionState::Stopped);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

fn wait_for_doorbell(event: &mut RegionEvent, wait: Duration) -> bool {
    match event.wait(wait) {
        Ok(WaitStatus::Signaled) => {
            event.reset();
            true
        }
        Ok(WaitStatus::Timeout) => true,
        Err(e) => {
            error!("Doorbell wait failed: {e}");
            false
        }
    }
}

fn frame_worker(shared: &Shared, frames: &Subscription, mut event: RegionEvent, wait: Duration) {
    while shared.state() == SessionState::Running {
        if let Some(_permit) = shared.gate.acquire_timeout(wait) {
            match frames.advance_to_newest() {
                Ok(_) | Err(QueueError::Empty) => {}
                Err(e) => {
                    error!("Frame stream failed: {e}");
                    break;
                }
            }
        }
        if !wait_for_doorbell(&mut event, wait) {
            break;
        }
    }

    frames.unsubscribe();
    shared.transition(SessionState::Running, SessionState::Stopping);
}

fn pointer_worker(shared: &Shared, pointer: &Subscription, mut event: RegionEvent, wait: Duration) {
    while shared.state() == SessionState::Running {
        match pointer.receive_next() {
            Ok(message) => {
                let flags = CursorFlags::from_bits_truncate(message.udata());
                if let Err(e) = shared.cursor.apply(flags, message.data()) {
                    warn!("Ignoring cursor message {}: {e}", message.index());
                }
                if let Err(e) = pointer.complete_message(message) {
                    error!("Pointer stream failed: {e}");
                    break;
                }
            }
            Err(QueueError::Empty) => {
                if !wait_for_doorbell(&mut event, wait) {
                    break;
                }
            }
            Err(e) => {
                error!("Pointer stream failed: {e}");
                break;
            }
        }
    }

    pointer.unsubscribe();
    shared.transition(SessionState::Running, SessionState::Stopping);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::HeadlessRenderer;
    use lg_stream_protocol::layout::FrameSlotLayout;
    use lg_stream_protocol::{CursorDescriptor, CursorEncoding, ProducerSession};
    use std::time::Instant;

    fn test_config(path: &Path) -> ClientConfig {
        ClientConfig {
            shm_path: path.to_path_buf(),
            worker_wait_ms: 10,
            ..Default::default()
        }
    }

    fn create_region(path: &Path) -> SharedRegion {
        let size = SharedRegion::required_size(FrameSlotLayout::min_region_size(4096));
        SharedRegion::create(path, size).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.tick_interval(), Duration::from_micros(16_666));
        config.validate().unwrap();

        let zero = ClientConfig {
            tick_rate: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        fs::write(&path, r#"{"shm_path": "/dev/shm/other", "tick_rate": 144}"#).unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.shm_path, PathBuf::from("/dev/shm/other"));
        assert_eq!(config.tick_rate, 144);
        assert_eq!(config.worker_wait_ms, ClientConfig::default().worker_wait_ms);

        assert!(matches!(
            ClientConfig::from_file(&dir.path().join("missing.json")),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_state_machine_guards() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = StreamSession::new(test_config(&dir.path().join("region")));

        assert!(matches!(
            session.start(),
            Err(SessionError::InvalidState { action: "start", .. })
        ));
        let mut renderer = HeadlessRenderer::new();
        assert_eq!(session.video_tick(&mut renderer).unwrap(), TickOutcome::Idle);
    }

    #[test]
    fn test_failed_open_leaves_nothing_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let mut session = StreamSession::new(test_config(&path));

        assert!(matches!(
            session.open(),
            Err(SessionError::Region(RegionError::NotFound(_)))
        ));
        assert_eq!(session.state(), SessionState::Stopped);

        // A region no producer has initialized yet.
        let _region = create_region(&path);
        assert!(matches!(
            session.open(),
            Err(SessionError::Queue(QueueError::NotReady(_)))
        ));
        assert_eq!(session.state(), SessionState::Stopped);

        session.deinitialize();
        session.deinitialize();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_lifecycle_and_cursor_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let region = create_region(&path);
        let producer = ProducerSession::initialize(region.view().unwrap()).unwrap();

        let mut session = StreamSession::new(test_config(&path));
        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.session_id(), Some(producer.session_id()));
        assert!(matches!(
            session.open(),
            Err(SessionError::InvalidState { action: "open", .. })
        ));

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(producer.frames().subscribed().unwrap());

        let descriptor = CursorDescriptor {
            encoding: CursorEncoding::Color as u32,
            x: 12,
            y: 34,
            width: 1,
            height: 1,
            pitch: 4,
            ..Default::default()
        };
        let flags = CursorFlags::VISIBLE | CursorFlags::POSITION | CursorFlags::SHAPE;
        producer
            .pointer()
            .post_copy(flags.bits(), &[descriptor.as_bytes(), &[1, 2, 3, 4]])
            .unwrap();
        producer.notify(StreamId::Pointer).unwrap();

        assert!(wait_until(|| session.cursor().version() == 1));
        assert_eq!(session.cursor().position(), (12, 34));
        assert!(session.cursor().is_visible());
        assert!(wait_until(|| producer.pointer().pending().unwrap() == 0));

        session.stop();
        assert_eq!(session.state(), SessionState::Open);
        assert!(!producer.frames().subscribed().unwrap());
        session.stop();

        // The same mapping can be started again.
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.deinitialize();
        session.deinitialize();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.session_id(), None);
    }

    #[test]
    fn test_producer_restart_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let region = create_region(&path);
        let _producer = ProducerSession::initialize(region.view().unwrap()).unwrap();

        let mut session = StreamSession::new(test_config(&path));
        session.open().unwrap();
        session.start().unwrap();

        let _restarted = ProducerSession::initialize(region.view().unwrap()).unwrap();
        assert!(wait_until(|| session.state() == SessionState::Stopping));

        let mut renderer = HeadlessRenderer::new();
        assert_eq!(session.video_tick(&mut renderer).unwrap(), TickOutcome::Idle);

        session.deinitialize();
        session.open().unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
    }
}
