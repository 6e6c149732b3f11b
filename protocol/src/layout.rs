// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Byte layout of the shared region
//!
//! ```text
//! 0x0000  SessionDescriptor (32 bytes, padded to 64)
//! 0x0040  QueueHeader: frame stream
//! 0x0080  QueueHeader: pointer stream
//! 0x00C0  MessageRecord[FRAME_QUEUE_DEPTH]
//!         MessageRecord[POINTER_QUEUE_DEPTH]
//!         FrameDescriptor[FRAME_SLOT_COUNT]       (64-byte aligned)
//!         pointer payload ring                    (64-byte aligned)
//! HEADER_SIZE
//!         frame slot 0 pixel data                 (16-byte aligned)
//!         frame slot 1 pixel data                 (16-byte aligned)
//! ```
//!
//! The region's last page is reserved by [`crate::region`] for the peer
//! table and doorbells and is not part of the usable size.

use crate::descriptor::{
    CursorDescriptor, FrameDescriptor, MessageRecord, QueueHeader, SessionDescriptor,
};

/// Rounds `value` up to the next multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Frame pixel data alignment
pub const FRAME_DATA_ALIGN: usize = 16;

/// Number of frame slots (double buffering)
pub const FRAME_SLOT_COUNT: usize = 2;

/// Frame stream depth, one more than the slot count so a stale message never
/// blocks a post
pub const FRAME_QUEUE_DEPTH: u32 = 4;

/// Pointer stream depth
pub const POINTER_QUEUE_DEPTH: u32 = 8;

/// Largest cursor shape payload accepted in bytes
pub const MAX_CURSOR_SIZE: usize = 64 * 1024;

pub const SESSION_DESCRIPTOR_OFFSET: usize = 0;
pub const FRAME_QUEUE_OFFSET: usize = align_up(SessionDescriptor::SIZE, 64);
pub const POINTER_QUEUE_OFFSET: usize = FRAME_QUEUE_OFFSET + QueueHeader::SIZE;
pub const FRAME_RECORDS_OFFSET: usize = POINTER_QUEUE_OFFSET + QueueHeader::SIZE;
pub const POINTER_RECORDS_OFFSET: usize =
    FRAME_RECORDS_OFFSET + FRAME_QUEUE_DEPTH as usize * MessageRecord::SIZE;
pub const FRAME_DESCRIPTORS_OFFSET: usize =
    align_up(POINTER_RECORDS_OFFSET + POINTER_QUEUE_DEPTH as usize * MessageRecord::SIZE, 64);

/// Stride of one pointer payload chunk: descriptor plus the largest shape
pub const POINTER_PAYLOAD_STRIDE: usize = align_up(CursorDescriptor::SIZE + MAX_CURSOR_SIZE, 64);

pub const POINTER_PAYLOAD_OFFSET: usize = align_up(
    FRAME_DESCRIPTORS_OFFSET + FRAME_SLOT_COUNT * align_up(FrameDescriptor::SIZE, 64),
    64,
);

/// Everything before the first frame slot, page aligned
pub const HEADER_SIZE: usize = align_up(
    POINTER_PAYLOAD_OFFSET + POINTER_QUEUE_DEPTH as usize * POINTER_PAYLOAD_STRIDE,
    4096,
);

/// Offset of the frame descriptor for `slot`
pub const fn frame_descriptor_offset(slot: usize) -> usize {
    FRAME_DESCRIPTORS_OFFSET + slot * align_up(FrameDescriptor::SIZE, 64)
}

/// Offset of pointer payload chunk `index` (taken modulo the queue depth)
pub const fn pointer_payload_offset(index: u32) -> usize {
    POINTER_PAYLOAD_OFFSET + (index % POINTER_QUEUE_DEPTH) as usize * POINTER_PAYLOAD_STRIDE
}

/// Frame slot does not fit in the region
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error(
    "Frame slot {slot} at offset {offset:#x} with {max_frame_size} bytes exceeds the {available} bytes available"
)]
pub struct SlotCapacityError {
    pub slot: usize,
    pub offset: usize,
    pub max_frame_size: usize,
    pub available: usize,
}

/// Placement of the frame slots for a given region and frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlotLayout {
    /// Usable region size in bytes
    pub region_size: usize,
    /// Largest frame the producer will write
    pub max_frame_size: usize,
}

impl FrameSlotLayout {
    pub fn new(region_size: usize, max_frame_size: usize) -> Self {
        FrameSlotLayout {
            region_size,
            max_frame_size,
        }
    }

    /// Bytes available for frame data after the header
    pub fn available(&self) -> usize {
        self.region_size.saturating_sub(HEADER_SIZE)
    }

    /// Aligned absolute offset of the pixel data for `slot`.
    ///
    /// The capacity test compares the data offset against the space after
    /// the header, which is conservative by exactly one header.
    pub fn data_offset(&self, slot: usize) -> Result<usize, SlotCapacityError> {
        let err = |offset| SlotCapacityError {
            slot,
            offset,
            max_frame_size: self.max_frame_size,
            available: self.available(),
        };

        let offset = slot
            .checked_mul(self.max_frame_size)
            .and_then(|o| o.checked_add(HEADER_SIZE + FRAME_DATA_ALIGN - 1))
            .map(|o| o & !(FRAME_DATA_ALIGN - 1))
            .ok_or_else(|| err(usize::MAX))?;

        match offset.checked_add(self.max_frame_size) {
            Some(end) if end <= self.available() => Ok(offset),
            _ => Err(err(offset)),
        }
    }

    /// Checks that every slot fits
    pub fn validate(&self) -> Result<(), SlotCapacityError> {
        for slot in 0..FRAME_SLOT_COUNT {
            self.data_offset(slot)?;
        }
        Ok(())
    }

    /// Smallest usable region size holding both slots of `max_frame_size`
    pub fn min_region_size(max_frame_size: usize) -> usize {
        let last = FRAME_SLOT_COUNT - 1;
        align_up(HEADER_SIZE + last * max_frame_size, FRAME_DATA_ALIGN) + max_frame_size + HEADER_SIZE
    }
}
