// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Session and stream queues over a [`RegionView`]
//!
//! Each stream is a single-producer/single-consumer ring of
//! [`MessageRecord`]s. `head` counts posted messages and is written only by
//! the producer; `tail` counts completed messages and is written only by the
//! consumer. Both are monotonic wrapping counters, so `head - tail` is the
//! number of outstanding messages.
//!
//! ```text
//!  producer                          consumer
//!  --------                          --------
//!  write record[head % cap]
//!  head += 1 (Release)  ───────────► head (Acquire)
//!  ring consumer doorbell            read record[tail % cap]
//!                                    tail += 1 (Release)
//!  tail (Acquire)  ◄───────────────  ring producer doorbell
//! ```
//!
//! The frame stream is consumed latest-wins with
//! [`Subscription::advance_to_newest`]; the pointer stream in order with
//! [`Subscription::receive_next`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, info};

use crate::descriptor::{MessageRecord, QueueHeader, SessionDescriptor, StreamId};
use crate::layout::{
    FRAME_QUEUE_DEPTH, FRAME_QUEUE_OFFSET, FRAME_RECORDS_OFFSET, HEADER_SIZE,
    POINTER_PAYLOAD_OFFSET, POINTER_PAYLOAD_STRIDE, POINTER_QUEUE_DEPTH, POINTER_QUEUE_OFFSET,
    POINTER_RECORDS_OFFSET, SESSION_DESCRIPTOR_OFFSET,
};
use crate::region::{PeerId, RegionError, RegionView, NO_PEER};

/// Largest queue depth accepted from a peer
pub const MAX_QUEUE_DEPTH: u32 = 64;

/// Queue and session errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Protocol mismatch: magic {magic:02x?}, version {version}")]
    ProtocolMismatch { magic: [u8; 8], version: u32 },

    #[error("Stream {0} has not been initialized by the producer")]
    NotReady(StreamId),

    #[error("No message pending")]
    Empty,

    #[error("Queue is full")]
    Full,

    #[error("Producer session changed")]
    InvalidSession,

    #[error("Message {index} is not the outstanding message {expected}")]
    InvalidMessage { index: u32, expected: u32 },

    #[error("Message of {len} bytes exceeds the {max} byte payload stride")]
    TooLarge { len: usize, max: usize },

    #[error("Queue metadata is corrupt: {0}")]
    Corrupt(String),

    #[error("Subscription has been released")]
    Unsubscribed,

    #[error("Region error: {0}")]
    Region(#[from] RegionError),
}

fn header_offset(stream: StreamId) -> usize {
    match stream {
        StreamId::Frame => FRAME_QUEUE_OFFSET,
        StreamId::Pointer => POINTER_QUEUE_OFFSET,
    }
}

fn session_atomic(view: &RegionView, field: usize) -> Result<&AtomicU32, RegionError> {
    view.atomic_u32(SESSION_DESCRIPTOR_OFFSET + field)
}

fn header_atomic(view: &RegionView, stream: StreamId, field: usize) -> Result<&AtomicU32, RegionError> {
    view.atomic_u32(header_offset(stream) + field)
}

/// Producer side of a session: initializes the header and owns both streams
pub struct ProducerSession {
    view: RegionView,
    session_id: u32,
    frames: QueueHost,
    pointer: QueueHost,
}

impl ProducerSession {
    /// (Re)initialize the protocol header.
    ///
    /// Zeroes everything before the frame slots, keeps the consumer ID a
    /// consumer already registered, and publishes a new non-zero session ID.
    /// Subscriptions to the previous session fail with
    /// [`QueueError::InvalidSession`] from then on.
    pub fn initialize(view: RegionView) -> Result<Self, QueueError> {
        if view.size() < HEADER_SIZE {
            return Err(RegionError::OutOfBounds {
                offset: 0,
                len: HEADER_SIZE,
                size: view.size(),
            }
            .into());
        }

        let previous: SessionDescriptor = view.read(SESSION_DESCRIPTOR_OFFSET)?;
        let consumer_id = if previous.validate() || previous.is_blank() {
            session_atomic(&view, SessionDescriptor::CONSUMER_ID_OFFSET)?.load(Ordering::Acquire)
        } else {
            NO_PEER
        };
        let session_id = match previous.session_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };

        // Invalidate the old session before touching the queues.
        session_atomic(&view, SessionDescriptor::SESSION_ID_OFFSET)?.store(0, Ordering::Release);
        view.zero(SESSION_DESCRIPTOR_OFFSET, HEADER_SIZE)?;

        let frames = QueueHost::initialize(
            view.clone(),
            StreamId::Frame,
            FRAME_QUEUE_DEPTH,
            FRAME_RECORDS_OFFSET,
            0,
            0,
        )?;
        let pointer = QueueHost::initialize(
            view.clone(),
            StreamId::Pointer,
            POINTER_QUEUE_DEPTH,
            POINTER_RECORDS_OFFSET,
            POINTER_PAYLOAD_OFFSET,
            POINTER_PAYLOAD_STRIDE,
        )?;

        let descriptor = SessionDescriptor::new(0, view.peer_id(), consumer_id);
        view.write(SESSION_DESCRIPTOR_OFFSET, &descriptor)?;
        session_atomic(&view, SessionDescriptor::SESSION_ID_OFFSET)?
            .store(session_id, Ordering::Release);

        info!(
            "Initialized session {session_id} as producer {} (consumer {consumer_id})",
            view.peer_id()
        );

        Ok(ProducerSession {
            view,
            session_id,
            frames,
            pointer,
        })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn view(&self) -> &RegionView {
        &self.view
    }

    /// Peer ID the consumer registered, [`NO_PEER`] if none yet
    pub fn consumer_id(&self) -> PeerId {
        session_atomic(&self.view, SessionDescriptor::CONSUMER_ID_OFFSET)
            .map_or(NO_PEER, |id| id.load(Ordering::Acquire))
    }

    /// Signal the consumer on `stream`'s channel
    pub fn notify(&self, stream: StreamId) -> Result<(), RegionError> {
        self.view.ring_doorbell(self.consumer_id(), stream.channel())
    }

    pub fn frames(&self) -> &QueueHost {
        &self.frames
    }

    pub fn pointer(&self) -> &QueueHost {
        &self.pointer
    }

    pub fn stream(&self, stream: StreamId) -> &QueueHost {
        match stream {
            StreamId::Frame => &self.frames,
            StreamId::Pointer => &self.pointer,
        }
    }
}

/// Producer end of one stream
pub struct QueueHost {
    view: RegionView,
    stream: StreamId,
    capacity: u32,
    records_offset: usize,
    payload_offset: usize,
    payload_stride: usize,
}

impl QueueHost {
    /// Write the queue header and mark the stream ready
    pub fn initialize(
        view: RegionView,
        stream: StreamId,
        capacity: u32,
        records_offset: usize,
        payload_offset: usize,
        payload_stride: usize,
    ) -> Result<Self, QueueError> {
        if capacity == 0 || capacity > MAX_QUEUE_DEPTH {
            return Err(QueueError::Corrupt(format!("queue depth {capacity}")));
        }
        view.zero(records_offset, capacity as usize * MessageRecord::SIZE)?;
        if payload_stride > 0 {
            view.check_range(payload_offset, capacity as usize * payload_stride)?;
        }

        let header = QueueHeader {
            ready: 0,
            capacity,
            head: 0,
            tail: 0,
            records_offset: records_offset as u64,
            payload_offset: payload_offset as u64,
            payload_stride: payload_stride as u32,
            subscribed: 0,
            reserved: [0; 24],
        };
        view.write(header_offset(stream), &header)?;
        header_atomic(&view, stream, QueueHeader::READY_OFFSET)?.store(1, Ordering::Release);

        debug!("Stream {stream} ready, depth {capacity}");
        Ok(QueueHost {
            view,
            stream,
            capacity,
            records_offset,
            payload_offset,
            payload_stride,
        })
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn counter(&self, field: usize) -> Result<&AtomicU32, RegionError> {
        header_atomic(&self.view, self.stream, field)
    }

    /// Messages posted and not yet completed by the consumer
    pub fn pending(&self) -> Result<u32, QueueError> {
        let head = self.counter(QueueHeader::HEAD_OFFSET)?.load(Ordering::Acquire);
        let tail = self.counter(QueueHeader::TAIL_OFFSET)?.load(Ordering::Acquire);
        Ok(head.wrapping_sub(tail).min(self.capacity))
    }

    /// Messages completed by the consumer since initialization
    pub fn completed(&self) -> Result<u32, QueueError> {
        Ok(self.counter(QueueHeader::TAIL_OFFSET)?.load(Ordering::Acquire))
    }

    /// True while a consumer holds a subscription
    pub fn subscribed(&self) -> Result<bool, QueueError> {
        Ok(self.counter(QueueHeader::SUBSCRIBED_OFFSET)?.load(Ordering::Acquire) != 0)
    }

    /// Post a message describing `size` bytes at `offset`. Returns the
    /// message index.
    pub fn post(&self, udata: u32, offset: usize, size: usize) -> Result<u32, QueueError> {
        self.view.check_range(offset, size)?;
        let size = u32::try_from(size).map_err(|_| QueueError::TooLarge {
            len: size,
            max: u32::MAX as usize,
        })?;

        let head_counter = self.counter(QueueHeader::HEAD_OFFSET)?;
        let head = head_counter.load(Ordering::Relaxed);
        let tail = self.counter(QueueHeader::TAIL_OFFSET)?.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(QueueError::Full);
        }

        let record = MessageRecord {
            udata,
            size,
            offset: offset as u64,
        };
        let slot = (head % self.capacity) as usize;
        self.view
            .write(self.records_offset + slot * MessageRecord::SIZE, &record)?;
        head_counter.store(head.wrapping_add(1), Ordering::Release);
        Ok(head)
    }

    /// Copy `parts` back to back into the next payload chunk and post it
    pub fn post_copy(&self, udata: u32, parts: &[&[u8]]) -> Result<u32, QueueError> {
        if self.payload_stride == 0 {
            return Err(QueueError::Corrupt(format!(
                "stream {} has no payload ring",
                self.stream
            )));
        }
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > self.payload_stride {
            return Err(QueueError::TooLarge {
                len,
                max: self.payload_stride,
            });
        }

        let head = self.counter(QueueHeader::HEAD_OFFSET)?.load(Ordering::Relaxed);
        let tail = self.counter(QueueHeader::TAIL_OFFSET)?.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(QueueError::Full);
        }

        let chunk = self.payload_offset + (head % self.capacity) as usize * self.payload_stride;
        let mut at = chunk;
        for part in parts {
            self.view.copy_in(at, part)?;
            at += part.len();
        }
        self.post(udata, chunk, len)
    }
}

/// A message handed out by [`Subscription::receive_next`]
#[derive(Debug)]
pub struct Message<'a> {
    index: u32,
    udata: u32,
    offset: usize,
    data: &'a [u8],
}

impl<'a> Message<'a> {
    /// Position of the message in the stream
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn udata(&self) -> u32 {
        self.udata
    }

    /// Absolute offset of the payload in the region
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Consumer side of a session
pub struct QueueClient {
    view: RegionView,
    session_id: u32,
}

impl QueueClient {
    /// Validate the session descriptor and register as its consumer.
    ///
    /// A region no producer has written yet reports
    /// [`QueueError::NotReady`]; the consumer ID is still recorded so a
    /// producer starting later can signal it.
    pub fn attach(view: RegionView) -> Result<Self, QueueError> {
        let descriptor: SessionDescriptor = view.read(SESSION_DESCRIPTOR_OFFSET)?;
        if !descriptor.is_blank() && !descriptor.validate() {
            return Err(QueueError::ProtocolMismatch {
                magic: descriptor.magic,
                version: descriptor.version,
            });
        }

        session_atomic(&view, SessionDescriptor::CONSUMER_ID_OFFSET)?
            .store(view.peer_id(), Ordering::Release);

        let session_id =
            session_atomic(&view, SessionDescriptor::SESSION_ID_OFFSET)?.load(Ordering::Acquire);
        if descriptor.is_blank() || session_id == 0 {
            return Err(QueueError::NotReady(StreamId::Frame));
        }

        info!(
            "Attached to session {session_id} as consumer {}",
            view.peer_id()
        );
        Ok(QueueClient { view, session_id })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn view(&self) -> &RegionView {
        &self.view
    }

    /// True while the producer session this client attached to is current
    pub fn is_current(&self) -> bool {
        session_atomic(&self.view, SessionDescriptor::SESSION_ID_OFFSET)
            .is_ok_and(|id| id.load(Ordering::Acquire) == self.session_id)
    }

    /// Subscribe to `stream`, marking it subscribed and signaling the
    /// producer
    pub fn subscribe(&self, stream: StreamId) -> Result<Subscription, QueueError> {
        if !self.is_current() {
            return Err(QueueError::InvalidSession);
        }
        if header_atomic(&self.view, stream, QueueHeader::READY_OFFSET)?.load(Ordering::Acquire) == 0 {
            return Err(QueueError::NotReady(stream));
        }

        let header: QueueHeader = self.view.read(header_offset(stream))?;
        if header.capacity == 0 || header.capacity > MAX_QUEUE_DEPTH {
            return Err(QueueError::Corrupt(format!(
                "stream {stream} depth {}",
                header.capacity
            )));
        }
        let records_offset = usize::try_from(header.records_offset)
            .map_err(|_| QueueError::Corrupt(format!("stream {stream} records offset")))?;
        self.view
            .check_range(records_offset, header.capacity as usize * MessageRecord::SIZE)?;

        header_atomic(&self.view, stream, QueueHeader::SUBSCRIBED_OFFSET)?.store(1, Ordering::Release);

        let subscription = Subscription {
            view: self.view.clone(),
            stream,
            session_id: self.session_id,
            capacity: header.capacity,
            records_offset,
            active: AtomicBool::new(true),
        };
        subscription.notify_producer();
        debug!("Subscribed to {stream} stream");
        Ok(subscription)
    }
}

/// Consumer end of one stream.
///
/// All operations take `&self` so a subscription can be shared between a
/// worker thread and a presenter; the protocol itself serializes them (one
/// outstanding message at a time on the consumer side).
pub struct Subscription {
    view: RegionView,
    stream: StreamId,
    session_id: u32,
    capacity: u32,
    records_offset: usize,
    active: AtomicBool,
}

impl Subscription {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn view(&self) -> &RegionView {
        &self.view
    }

    fn counter(&self, field: usize) -> Result<&AtomicU32, QueueError> {
        Ok(header_atomic(&self.view, self.stream, field)?)
    }

    fn check_session(&self) -> Result<(), QueueError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(QueueError::Unsubscribed);
        }
        let current =
            session_atomic(&self.view, SessionDescriptor::SESSION_ID_OFFSET)?.load(Ordering::Acquire);
        if current != self.session_id {
            return Err(QueueError::InvalidSession);
        }
        Ok(())
    }

    fn positions(&self) -> Result<(u32, u32), QueueError> {
        let head = self.counter(QueueHeader::HEAD_OFFSET)?.load(Ordering::Acquire);
        let tail = self.counter(QueueHeader::TAIL_OFFSET)?.load(Ordering::Relaxed);
        if head.wrapping_sub(tail) > self.capacity {
            return Err(QueueError::Corrupt(format!(
                "stream {} head {head} tail {tail}",
                self.stream
            )));
        }
        Ok((head, tail))
    }

    fn record(&self, index: u32) -> Result<MessageRecord, QueueError> {
        let slot = (index % self.capacity) as usize;
        Ok(self
            .view
            .read(self.records_offset + slot * MessageRecord::SIZE)?)
    }

    fn notify_producer(&self) {
        let producer = session_atomic(&self.view, SessionDescriptor::PRODUCER_ID_OFFSET)
            .map_or(NO_PEER, |id| id.load(Ordering::Acquire));
        if let Err(e) = self.view.ring_doorbell(producer, self.stream.channel()) {
            debug!("Could not signal producer on {} stream: {e}", self.stream);
        }
    }

    /// Messages posted and not yet completed
    pub fn pending(&self) -> Result<u32, QueueError> {
        self.check_session()?;
        let (head, tail) = self.positions()?;
        Ok(head.wrapping_sub(tail))
    }

    /// Discard everything but the newest message and return its index.
    ///
    /// The newest message stays outstanding: the producer does not reuse its
    /// slot until the next call discards it.
    pub fn advance_to_newest(&self) -> Result<u32, QueueError> {
        self.check_session()?;
        let (head, tail) = self.positions()?;
        if head == tail {
            return Err(QueueError::Empty);
        }

        let newest = head.wrapping_sub(1);
        if newest != tail {
            self.counter(QueueHeader::TAIL_OFFSET)?
                .store(newest, Ordering::Release);
            self.notify_producer();
        }
        Ok(newest)
    }

    /// Read the message at the tail without completing it
    pub fn receive_next(&self) -> Result<Message<'_>, QueueError> {
        self.check_session()?;
        let (head, tail) = self.positions()?;
        if head == tail {
            return Err(QueueError::Empty);
        }

        let record = self.record(tail)?;
        let offset = usize::try_from(record.offset).map_err(|_| {
            QueueError::Corrupt(format!("message {tail} offset {:#x}", record.offset))
        })?;
        let data = self
            .view
            .bytes(offset, record.size as usize)
            .map_err(|e| QueueError::Corrupt(format!("message {tail}: {e}")))?;

        Ok(Message {
            index: tail,
            udata: record.udata,
            offset,
            data,
        })
    }

    /// Complete the outstanding message, releasing it to the producer
    // Taking the message by value ends its borrow of the payload.
    #[allow(clippy::needless_pass_by_value)]
    pub fn complete_message(&self, message: Message<'_>) -> Result<(), QueueError> {
        self.check_session()?;
        let (_, tail) = self.positions()?;
        if message.index != tail {
            return Err(QueueError::InvalidMessage {
                index: message.index,
                expected: tail,
            });
        }

        self.counter(QueueHeader::TAIL_OFFSET)?
            .store(tail.wrapping_add(1), Ordering::Release);
        self.notify_producer();
        Ok(())
    }

    /// Release the subscription. Idempotent; also done on drop.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let current = session_atomic(&self.view, SessionDescriptor::SESSION_ID_OFFSET)
            .map_or(0, |id| id.load(Ordering::Acquire));
        if current != self.session_id {
            return;
        }
        if let Ok(subscribed) = header_atomic(&self.view, self.stream, QueueHeader::SUBSCRIBED_OFFSET) {
            subscribed.store(0, Ordering::Release);
        }
        self.notify_producer();
        debug!("Unsubscribed from {} stream", self.stream);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
