// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-layout structures shared between producer and consumer
//!
//! Every structure here is `#[repr(C)]`, uses only fixed-width integer
//! fields and is placed at a fixed offset inside the shared region (see
//! [`crate::layout`]). Both endpoints are built from this one definition, so
//! the byte layout cannot drift between them; the sizes are pinned by tests.

use std::fmt;

/// Magic bytes identifying the protocol family
pub const SESSION_MAGIC: [u8; 8] = *b"LGSTRM\0\0";

/// Current protocol version
pub const SESSION_VERSION: u32 = 1;

/// Plain-old-data types that may be copied to and from shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding the compiler may
/// leave uninitialized, no pointers, and accept any bit pattern.
pub unsafe trait Pod: Copy + Default + 'static {}

/// Session descriptor (offset 0 of the region)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Magic bytes, [`SESSION_MAGIC`] once initialized
    pub magic: [u8; 8],
    /// Protocol version
    pub version: u32,
    /// Bumped on every producer (re)initialization, never 0 once valid
    pub session_id: u32,
    /// Peer ID of the producer
    pub producer_id: u32,
    /// Peer ID of the consumer (retained across producer restarts)
    pub consumer_id: u32,
    /// Reserved for future use
    pub reserved: [u8; 8],
}

// SAFETY: repr(C), integer fields only, no implicit padding (8+4*4+8 = 32).
unsafe impl Pod for SessionDescriptor {}

impl SessionDescriptor {
    /// Size of the descriptor in bytes
    pub const SIZE: usize = std::mem::size_of::<SessionDescriptor>();

    /// Byte offset of the consumer ID field
    pub const CONSUMER_ID_OFFSET: usize = std::mem::offset_of!(SessionDescriptor, consumer_id);

    /// Byte offset of the session ID field
    pub const SESSION_ID_OFFSET: usize = std::mem::offset_of!(SessionDescriptor, session_id);

    /// Byte offset of the producer ID field
    pub const PRODUCER_ID_OFFSET: usize = std::mem::offset_of!(SessionDescriptor, producer_id);

    /// Creates a populated descriptor for a new producer session
    pub fn new(session_id: u32, producer_id: u32, consumer_id: u32) -> Self {
        SessionDescriptor {
            magic: SESSION_MAGIC,
            version: SESSION_VERSION,
            session_id,
            producer_id,
            consumer_id,
            reserved: [0; 8],
        }
    }

    /// Validates the magic and version against this build
    pub fn validate(&self) -> bool {
        self.magic == SESSION_MAGIC && self.version == SESSION_VERSION
    }

    /// True while no producer has ever written the region
    pub fn is_blank(&self) -> bool {
        self.magic == [0; 8]
    }
}

/// Frame pixel layout
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// 32-bit BGRA
    #[default]
    Bgra = 0,
    /// 32-bit RGBA
    Rgba = 1,
    /// 32-bit packed 10:10:10:2
    Rgba10 = 2,
    /// 64-bit half-float RGBA
    Rgba16F = 3,
}

impl TryFrom<u32> for FrameFormat {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameFormat::Bgra),
            1 => Ok(FrameFormat::Rgba),
            2 => Ok(FrameFormat::Rgba10),
            3 => Ok(FrameFormat::Rgba16F),
            _ => Err("Invalid frame format value"),
        }
    }
}

impl FrameFormat {
    /// Get bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            FrameFormat::Bgra | FrameFormat::Rgba | FrameFormat::Rgba10 => 4,
            FrameFormat::Rgba16F => 8,
        }
    }
}

/// Frame descriptor, one per frame slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Raw [`FrameFormat`] value
    pub format: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per source row
    pub stride: u32,
    /// Absolute offset of the pixel data in the region (16-byte aligned)
    pub data_offset: u64,
    /// Pixel data length in bytes, 0 when the capture failed
    pub data_length: u64,
    /// Pointer X position when the frame was published
    pub cursor_x: i32,
    /// Pointer Y position when the frame was published
    pub cursor_y: i32,
    /// Bumped whenever format or dimensions change
    pub format_version: u32,
    /// Reserved for future use
    pub reserved: u32,
}

// SAFETY: repr(C), integer fields only, no implicit padding (4*4+8+8+4*4 = 48).
unsafe impl Pod for FrameDescriptor {}

impl FrameDescriptor {
    /// Size of the descriptor in bytes
    pub const SIZE: usize = std::mem::size_of::<FrameDescriptor>();

    /// Gets the frame format
    pub fn frame_format(&self) -> Result<FrameFormat, &'static str> {
        FrameFormat::try_from(self.format)
    }

    /// Number of pixel bytes actually covered by `height` rows of `stride`
    pub fn covered_bytes(&self) -> u64 {
        self.stride as u64 * self.height as u64
    }
}

/// Cursor shape encoding
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorEncoding {
    /// 32-bit colour whose top byte is a transparency toggle
    MaskedColor = 0,
    /// 32-bit premultiplied colour
    Color = 1,
    /// 1-bit AND mask followed by 1-bit XOR mask
    Monochrome = 2,
}

impl TryFrom<u32> for CursorEncoding {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CursorEncoding::MaskedColor),
            1 => Ok(CursorEncoding::Color),
            2 => Ok(CursorEncoding::Monochrome),
            _ => Err("Invalid cursor encoding value"),
        }
    }
}

bitflags::bitflags! {
    /// Pointer message flags, carried in the message `udata`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u32 {
        /// Cursor is visible
        const VISIBLE = 1 << 0;
        /// Message carries a new shape
        const SHAPE = 1 << 1;
        /// Message carries a new position
        const POSITION = 1 << 2;
    }
}

impl Default for CursorFlags {
    fn default() -> Self {
        CursorFlags::empty()
    }
}

/// Cursor descriptor, at the start of every pointer message.
/// Shape bytes follow immediately when [`CursorFlags::SHAPE`] is set.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorDescriptor {
    /// Raw [`CursorEncoding`] value
    pub encoding: u32,
    /// Pointer X position
    pub x: i32,
    /// Pointer Y position
    pub y: i32,
    /// Hotspot X offset
    pub hot_x: i32,
    /// Hotspot Y offset
    pub hot_y: i32,
    /// Shape width in pixels
    pub width: u32,
    /// Shape height in pixels (both masks for monochrome)
    pub height: u32,
    /// Source row stride in bytes
    pub pitch: u32,
}

// SAFETY: repr(C), eight 4-byte integer fields, no implicit padding.
unsafe impl Pod for CursorDescriptor {}

impl CursorDescriptor {
    /// Size of the descriptor in bytes
    pub const SIZE: usize = std::mem::size_of::<CursorDescriptor>();

    /// Gets the shape encoding
    pub fn cursor_encoding(&self) -> Result<CursorEncoding, u32> {
        CursorEncoding::try_from(self.encoding).map_err(|_| self.encoding)
    }

    /// Reads a descriptor from the leading bytes of a pointer message
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        // SAFETY: the length was checked above, CursorDescriptor is Pod and
        // read_unaligned has no alignment requirement.
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const CursorDescriptor) })
    }

    /// Byte view of the descriptor, for copying into a message
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: CursorDescriptor is Pod with no padding; the slice covers
        // exactly the struct and lives as long as the borrow of `self`.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// Per-stream queue header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueHeader {
    /// 1 once the producer has initialized the stream
    pub ready: u32,
    /// Number of message records
    pub capacity: u32,
    /// Messages posted (monotonic, wrapping)
    pub head: u32,
    /// Messages completed (monotonic, wrapping)
    pub tail: u32,
    /// Offset of the record array
    pub records_offset: u64,
    /// Offset of the payload ring (0 when messages are posted in place)
    pub payload_offset: u64,
    /// Bytes per payload chunk
    pub payload_stride: u32,
    /// 1 while a consumer is subscribed
    pub subscribed: u32,
    /// Reserved for future use
    pub reserved: [u8; 24],
}

// SAFETY: repr(C), integer fields only, no implicit padding (16+16+8+24 = 64).
unsafe impl Pod for QueueHeader {}

impl QueueHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = std::mem::size_of::<QueueHeader>();

    pub const READY_OFFSET: usize = std::mem::offset_of!(QueueHeader, ready);
    pub const HEAD_OFFSET: usize = std::mem::offset_of!(QueueHeader, head);
    pub const TAIL_OFFSET: usize = std::mem::offset_of!(QueueHeader, tail);
    pub const SUBSCRIBED_OFFSET: usize = std::mem::offset_of!(QueueHeader, subscribed);
}

/// One queued message
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageRecord {
    /// User data (flags) attached by the producer
    pub udata: u32,
    /// Message size in bytes
    pub size: u32,
    /// Absolute offset of the message in the region
    pub offset: u64,
}

// SAFETY: repr(C), integer fields only, no implicit padding (4+4+8 = 16).
unsafe impl Pod for MessageRecord {}

impl MessageRecord {
    /// Size of a record in bytes
    pub const SIZE: usize = std::mem::size_of::<MessageRecord>();
}

/// Message streams multiplexed over one region
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Video frames, latest-wins
    Frame = 0,
    /// Cursor position and shape, in order
    Pointer = 1,
}

impl StreamId {
    /// Doorbell channel used to signal this stream in both directions
    pub fn channel(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Frame => write!(f, "frame"),
            StreamId::Pointer => write!(f, "pointer"),
        }
    }
}
