// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame publisher
//!
//! Captures into one of two alternating frame slots, waits for the consumer
//! to be ready, then describes the slot in its frame descriptor and posts a
//! frame message.
//!
//! ```text
//!  slot:     0          1          0          1
//!  capture ──► wait ──► describe ──► post ──► ring ──► next slot
//! ```
//!
//! The consumer is ready when it is subscribed to the frame stream and has
//! completed or discarded every frame message posted so far, so the slot
//! about to be described is never one it still reads from.
//!
//! The slot layout follows the capture backend's current maximum frame size.
//! A size that no longer fits the region fails each publish with
//! [`PublishError::Capacity`] until the backend shrinks again.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use lg_stream_protocol::layout::{frame_descriptor_offset, FRAME_SLOT_COUNT};
use lg_stream_protocol::{
    FrameDescriptor, FrameFormat, FrameSlotLayout, ProducerSession, QueueError, RegionError,
    RegionEvent, SlotCapacityError, StreamId, WaitError, WaitStatus,
};

use crate::capture::CaptureBackend;
use crate::pointer::CursorPosition;
use crate::slots::{SlotArena, SlotBusy, SlotState};

/// Length of one readiness wait slice
pub const WAIT_SLICE: Duration = Duration::from_secs(1);

/// How long the consumer may stall before it is reported
pub const STALL_WARNING: Duration = Duration::from_secs(10);

/// Publishing errors
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Frame slot does not fit: {0}")]
    Capacity(#[from] SlotCapacityError),

    #[error("Capture failed: {0}")]
    Capture(#[source] io::Error),

    #[error("Cursor source failed: {0}")]
    Cursor(#[source] io::Error),

    #[error("Synchronization with the consumer failed: {0}")]
    Sync(#[from] WaitError),

    #[error("Frame slot unavailable: {0}")]
    SlotBusy(#[from] SlotBusy),

    #[error("Failed to signal the consumer: {0}")]
    Doorbell(#[source] RegionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Shutdown requested")]
    Shutdown,
}

impl PublishError {
    /// True for errors after which the publish loop cannot continue
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PublishError::Capacity(_)
                | PublishError::Capture(_)
                | PublishError::Cursor(_)
                | PublishError::Doorbell(_)
        )
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedFrame {
    /// Slot the frame was written to
    pub slot: usize,
    /// Frame message index
    pub message: u32,
    /// Descriptor as written to the region
    pub descriptor: FrameDescriptor,
}

/// Frame publisher
pub struct FramePublisher {
    session: Arc<ProducerSession>,
    layout: FrameSlotLayout,
    slots: SlotArena,
    slot_index: usize,
    event: RegionEvent,
    cursor: Arc<CursorPosition>,
    shutdown: Arc<AtomicBool>,
    format: Option<(FrameFormat, u32, u32, u32)>,
    format_version: u32,
    stall_warning: Duration,
}

impl FramePublisher {
    /// Create a publisher for frames of at most `max_frame_size` bytes
    pub fn new(
        session: Arc<ProducerSession>,
        max_frame_size: usize,
        cursor: Arc<CursorPosition>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, PublishError> {
        let view = session.view();
        let layout = FrameSlotLayout::new(view.size(), max_frame_size);
        let event = view.create_event(StreamId::Frame.channel())?;

        Ok(Self {
            session,
            layout,
            slots: SlotArena::new(),
            slot_index: 0,
            event,
            cursor,
            shutdown,
            format: None,
            format_version: 0,
            stall_warning: STALL_WARNING,
        })
    }

    /// Override the consumer stall warning interval
    pub fn with_stall_warning(mut self, interval: Duration) -> Self {
        self.stall_warning = interval;
        self
    }

    /// Slot the next frame is written to
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn layout(&self) -> &FrameSlotLayout {
        &self.layout
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots.state(slot)
    }

    /// True when the consumer is subscribed and holds no frame message
    pub fn consumer_ready(&self) -> Result<bool, PublishError> {
        let frames = self.session.frames();
        Ok(frames.subscribed()? && frames.pending()? == 0)
    }

    /// Block until the consumer is ready, in bounded slices that re-check
    /// the shutdown flag. A slow consumer is waited for indefinitely and
    /// reported periodically.
    fn wait_for_consumer(&mut self) -> Result<(), PublishError> {
        let started = Instant::now();
        let mut next_warning = self.stall_warning;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(PublishError::Shutdown);
            }
            if self.consumer_ready()? {
                return Ok(());
            }

            match self.event.wait(WAIT_SLICE)? {
                WaitStatus::Signaled => self.event.reset(),
                WaitStatus::Timeout => {
                    let waited = started.elapsed();
                    if waited >= next_warning {
                        warn!(
                            "Consumer has not released the frame stream for {}s (subscribed: {})",
                            waited.as_secs(),
                            self.session.frames().subscribed()?
                        );
                        next_warning += self.stall_warning;
                    }
                }
            }
        }
    }

    /// Take `slot` for writing, waiting for the consumer if it still holds
    /// the frame message that references it
    fn acquire_slot(&mut self, slot: usize) -> Result<(), PublishError> {
        self.slots.reclaim(self.session.frames().completed()?);
        if self.slots.begin_write(slot).is_ok() {
            return Ok(());
        }

        debug!("Slot {slot} still referenced, waiting for the consumer");
        self.wait_for_consumer()?;
        self.slots.reclaim(self.session.frames().completed()?);
        Ok(self.slots.begin_write(slot)?)
    }

    /// Re-place the slots for a new maximum frame size. Waits until the
    /// consumer holds no frame so no slot moves under a reader.
    fn resize(&mut self, max_frame_size: usize) -> Result<(), PublishError> {
        self.wait_for_consumer()?;
        self.slots.reclaim(self.session.frames().completed()?);
        info!(
            "Frame slots resized from {} to {max_frame_size} bytes",
            self.layout.max_frame_size
        );
        self.layout = FrameSlotLayout::new(self.layout.region_size, max_frame_size);
        Ok(())
    }

    /// Capture and publish one frame.
    ///
    /// Once the frame message is posted the slot stays published until the
    /// consumer completes it, even when the doorbell then fails. The slot
    /// index only advances after the doorbell, so the next publish after a
    /// doorbell failure waits for that slot to be released.
    pub fn publish_frame(
        &mut self,
        capture: &mut dyn CaptureBackend,
    ) -> Result<PublishedFrame, PublishError> {
        let max_frame_size = capture.max_frame_size();
        if max_frame_size != self.layout.max_frame_size {
            self.resize(max_frame_size)?;
        }

        let slot = self.slot_index;
        let data_offset = self.layout.data_offset(slot)?;
        self.acquire_slot(slot)?;

        let published = match self.write_slot(capture, slot, data_offset, max_frame_size) {
            Ok(published) => published,
            Err(e) => {
                self.slots.abort_write(slot);
                return Err(e);
            }
        };
        self.slots.publish(slot, published.message);

        self.session
            .notify(StreamId::Frame)
            .map_err(PublishError::Doorbell)?;
        self.slot_index = (slot + 1) % FRAME_SLOT_COUNT;
        Ok(published)
    }

    fn write_slot(
        &mut self,
        capture: &mut dyn CaptureBackend,
        slot: usize,
        data_offset: usize,
        max_frame_size: usize,
    ) -> Result<PublishedFrame, PublishError> {
        let view = self.session.view().clone();
        let descriptor_offset = frame_descriptor_offset(slot);

        let mut descriptor: FrameDescriptor = view.read(descriptor_offset)?;
        descriptor.format = capture.frame_format() as u32;
        descriptor.data_offset = data_offset as u64;
        descriptor.data_length = 0;
        view.write(descriptor_offset, &descriptor)?;

        let frame = {
            // SAFETY: the slot arena holds this slot in Writing state and the
            // consumer has completed every message referencing it, so no
            // other reader or writer touches the range until it is posted.
            let target = unsafe { view.bytes_mut(data_offset, max_frame_size)? };
            capture.grab_frame(target).map_err(PublishError::Capture)?
        };
        if !frame.fits(max_frame_size) {
            return Err(PublishError::Capture(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} returned {}x{} stride {} ({} bytes) for a {max_frame_size} byte slot",
                    capture.name(),
                    frame.width,
                    frame.height,
                    frame.stride,
                    frame.data_length
                ),
            )));
        }

        self.wait_for_consumer()?;

        let shape = (frame.format, frame.width, frame.height, frame.stride);
        if self.format != Some(shape) {
            self.format_version = self.format_version.wrapping_add(1);
            self.format = Some(shape);
            debug!(
                "Frame format now {:?} {}x{} stride {} (version {})",
                frame.format, frame.width, frame.height, frame.stride, self.format_version
            );
        }

        let (cursor_x, cursor_y) = self.cursor.load();
        let descriptor = FrameDescriptor {
            format: frame.format as u32,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            data_offset: data_offset as u64,
            data_length: frame.data_length as u64,
            cursor_x,
            cursor_y,
            format_version: self.format_version,
            reserved: 0,
        };
        view.write(descriptor_offset, &descriptor)?;
        self.event.reset();

        let message = self
            .session
            .frames()
            .post(slot as u32, descriptor_offset, FrameDescriptor::SIZE)?;

        Ok(PublishedFrame {
            slot,
            message,
            descriptor,
        })
    }
}
