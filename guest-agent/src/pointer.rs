// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cursor publisher
//!
//! Polls a [`CursorSource`] and posts position, visibility and shape updates
//! on the pointer stream. Updates that do not fit because the queue is full
//! are kept and merged into the next poll.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use lg_stream_protocol::layout::MAX_CURSOR_SIZE;
use lg_stream_protocol::{CursorDescriptor, CursorFlags, ProducerSession, QueueError, StreamId};

use crate::cursor::{CursorShape, CursorSource};
use crate::publisher::PublishError;

/// Latest pointer position, shared with the frame publisher
#[derive(Debug, Default)]
pub struct CursorPosition {
    x: AtomicI32,
    y: AtomicI32,
}

impl CursorPosition {
    pub fn store(&self, x: i32, y: i32) {
        self.x.store(x, Ordering::Relaxed);
        self.y.store(y, Ordering::Relaxed);
    }

    pub fn load(&self) -> (i32, i32) {
        (self.x.load(Ordering::Relaxed), self.y.load(Ordering::Relaxed))
    }
}

/// Cursor publisher
pub struct CursorPublisher {
    session: Arc<ProducerSession>,
    position: Arc<CursorPosition>,
    last_position: Option<(i32, i32)>,
    last_visible: Option<bool>,
    pending_shape: Option<CursorShape>,
    pending_position: bool,
    pending_visibility: bool,
}

impl CursorPublisher {
    pub fn new(session: Arc<ProducerSession>, position: Arc<CursorPosition>) -> Self {
        Self {
            session,
            position,
            last_position: None,
            last_visible: None,
            pending_shape: None,
            pending_position: false,
            pending_visibility: false,
        }
    }

    /// True while an update is waiting for queue space
    pub fn has_pending(&self) -> bool {
        self.pending_shape.is_some() || self.pending_position || self.pending_visibility
    }

    /// Poll `source` once and post a message if anything changed.
    /// Returns whether a message was posted.
    pub fn poll(&mut self, source: &mut dyn CursorSource) -> Result<bool, PublishError> {
        if let Some(shape) = source.poll_shape().map_err(PublishError::Cursor)? {
            if shape.data.len() > MAX_CURSOR_SIZE {
                warn!(
                    "Dropping {}x{} cursor shape, {} bytes exceeds {MAX_CURSOR_SIZE}",
                    shape.width,
                    shape.height,
                    shape.data.len()
                );
            } else {
                self.pending_shape = Some(shape);
            }
        }

        let position = source.position().map_err(PublishError::Cursor)?;
        if self.last_position != Some(position) {
            self.last_position = Some(position);
            self.position.store(position.0, position.1);
            self.pending_position = true;
        }

        let visible = source.is_visible();
        if self.last_visible != Some(visible) {
            self.last_visible = Some(visible);
            self.pending_visibility = true;
        }

        if !self.has_pending() {
            return Ok(false);
        }
        self.flush(visible, position)
    }

    fn flush(&mut self, visible: bool, (x, y): (i32, i32)) -> Result<bool, PublishError> {
        let mut flags = CursorFlags::empty();
        flags.set(CursorFlags::VISIBLE, visible);
        flags.set(CursorFlags::POSITION, self.pending_position);

        let mut descriptor = CursorDescriptor {
            x,
            y,
            ..Default::default()
        };
        let mut shape_bytes: &[u8] = &[];
        if let Some(shape) = &self.pending_shape {
            flags |= CursorFlags::SHAPE;
            descriptor.encoding = shape.encoding as u32;
            descriptor.width = shape.width;
            descriptor.height = shape.height;
            descriptor.pitch = shape.pitch;
            descriptor.hot_x = shape.hot_x;
            descriptor.hot_y = shape.hot_y;
            shape_bytes = &shape.data;
        }

        match self
            .session
            .pointer()
            .post_copy(flags.bits(), &[descriptor.as_bytes(), shape_bytes])
        {
            Ok(index) => debug!("Posted cursor message {index} ({flags:?})"),
            Err(QueueError::Full) => {
                debug!("Pointer queue full, retrying on next poll");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        self.pending_shape = None;
        self.pending_position = false;
        self.pending_visibility = false;

        // The consumer may not be attached yet; it drains the queue once it
        // subscribes.
        if let Err(e) = self.session.notify(StreamId::Pointer) {
            debug!("Cursor update not signaled: {e}");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::stub_cursor::StubCursorSource;
    use lg_stream_protocol::layout::{FrameSlotLayout, POINTER_QUEUE_DEPTH};
    use lg_stream_protocol::region::TRANSPORT_BLOCK_SIZE;
    use lg_stream_protocol::{CursorEncoding, QueueClient, SharedRegion};
    use std::io;

    /// Source whose state the test drives directly
    #[derive(Default)]
    struct ScriptedSource {
        position: (i32, i32),
        visible: bool,
        shape: Option<CursorShape>,
    }

    impl CursorSource for ScriptedSource {
        fn position(&mut self) -> io::Result<(i32, i32)> {
            Ok(self.position)
        }
        fn is_visible(&self) -> bool {
            self.visible
        }
        fn poll_shape(&mut self) -> io::Result<Option<CursorShape>> {
            Ok(self.shape.take())
        }
    }

    fn setup() -> (tempfile::TempDir, SharedRegion, SharedRegion, Arc<ProducerSession>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let size = FrameSlotLayout::min_region_size(1024) + TRANSPORT_BLOCK_SIZE;
        let producer = SharedRegion::create(&path, size).unwrap();
        let consumer = SharedRegion::open(&path).unwrap();
        let session = Arc::new(ProducerSession::initialize(producer.view().unwrap()).unwrap());
        (dir, producer, consumer, session)
    }

    #[test]
    fn test_first_poll_posts_everything() {
        let (_dir, _producer, consumer, session) = setup();
        let position = Arc::new(CursorPosition::default());
        let mut publisher = CursorPublisher::new(session, position.clone());
        let mut source = StubCursorSource::new(640, 480);

        assert!(publisher.poll(&mut source).unwrap());
        assert_eq!(position.load(), (0, 0));

        let client = QueueClient::attach(consumer.view().unwrap()).unwrap();
        let sub = client.subscribe(StreamId::Pointer).unwrap();
        let msg = sub.receive_next().unwrap();
        let flags = CursorFlags::from_bits_truncate(msg.udata());
        assert_eq!(
            flags,
            CursorFlags::VISIBLE | CursorFlags::POSITION | CursorFlags::SHAPE
        );

        let desc = CursorDescriptor::from_bytes(msg.data()).unwrap();
        let arrow = StubCursorSource::arrow();
        assert_eq!(desc.cursor_encoding(), Ok(CursorEncoding::Color));
        assert_eq!((desc.width, desc.height, desc.pitch), (arrow.width, arrow.height, arrow.pitch));
        assert_eq!(&msg.data()[CursorDescriptor::SIZE..], arrow.data.as_slice());
        sub.complete_message(msg).unwrap();
    }

    #[test]
    fn test_unchanged_cursor_posts_nothing() {
        let (_dir, _producer, _consumer, session) = setup();
        let mut publisher = CursorPublisher::new(session.clone(), Arc::default());
        let mut source = ScriptedSource {
            visible: true,
            ..Default::default()
        };

        assert!(publisher.poll(&mut source).unwrap());
        assert!(!publisher.poll(&mut source).unwrap());
        assert_eq!(session.pointer().pending().unwrap(), 1);

        source.position = (5, 6);
        assert!(publisher.poll(&mut source).unwrap());
        source.visible = false;
        assert!(publisher.poll(&mut source).unwrap());
        assert_eq!(session.pointer().pending().unwrap(), 3);
    }

    #[test]
    fn test_full_queue_keeps_shape() {
        let (_dir, _producer, consumer, session) = setup();
        let mut publisher = CursorPublisher::new(session.clone(), Arc::default());
        let mut source = ScriptedSource {
            visible: true,
            ..Default::default()
        };

        for i in 0..POINTER_QUEUE_DEPTH as i32 {
            source.position = (i, i);
            assert!(publisher.poll(&mut source).unwrap());
        }

        source.position = (100, 100);
        source.shape = Some(StubCursorSource::arrow());
        assert!(!publisher.poll(&mut source).unwrap());
        assert!(publisher.has_pending());

        let client = QueueClient::attach(consumer.view().unwrap()).unwrap();
        let sub = client.subscribe(StreamId::Pointer).unwrap();
        let msg = sub.receive_next().unwrap();
        sub.complete_message(msg).unwrap();

        // The retained shape goes out with the next poll.
        assert!(publisher.poll(&mut source).unwrap());
        assert!(!publisher.has_pending());
        for _ in 0..POINTER_QUEUE_DEPTH - 1 {
            let msg = sub.receive_next().unwrap();
            sub.complete_message(msg).unwrap();
        }
        let last = sub.receive_next().unwrap();
        let flags = CursorFlags::from_bits_truncate(last.udata());
        assert!(flags.contains(CursorFlags::SHAPE | CursorFlags::POSITION));
        let desc = CursorDescriptor::from_bytes(last.data()).unwrap();
        assert_eq!((desc.x, desc.y), (100, 100));
    }

    #[test]
    fn test_oversized_shape_is_dropped() {
        let (_dir, _producer, _consumer, session) = setup();
        let mut publisher = CursorPublisher::new(session, Arc::default());
        let mut source = ScriptedSource {
            shape: Some(CursorShape {
                encoding: CursorEncoding::Color,
                width: 256,
                height: 256,
                pitch: 1024,
                hot_x: 0,
                hot_y: 0,
                data: vec![0; 256 * 1024],
            }),
            ..Default::default()
        };

        assert!(publisher.poll(&mut source).unwrap());
        assert!(!publisher.has_pending());
    }
}
