// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! lg-stream shared memory protocol
//!
//! Everything both endpoints of a stream need to agree on: the region
//! accessor with its doorbells, the fixed byte layout, the descriptor
//! structures and the message queues.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                     ┌──────────────────────┐
//! │  Producer (agent)    │                     │  Consumer (client)   │
//! │  ProducerSession     │                     │  QueueClient         │
//! │   ├─ QueueHost frame │                     │   ├─ Subscription    │
//! │   └─ QueueHost ptr   │                     │   └─ Subscription    │
//! └──────────┬───────────┘                     └───────────┬──────────┘
//!            │              RegionView (mmap)              │
//!            ▼                                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ session │ queues │ records │ frame descs │ cursor ring │ slots  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ transport block: peer table + doorbell counters                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`region`]: Mapping, peer IDs, doorbells and events
//! - [`layout`]: Offsets of every structure in the region
//! - [`descriptor`]: `#[repr(C)]` structures and enums
//! - [`queue`]: Producer session and stream queues

pub mod descriptor;
mod futex;
pub mod layout;
pub mod queue;
pub mod region;

pub use descriptor::{
    CursorDescriptor, CursorEncoding, CursorFlags, FrameDescriptor, FrameFormat, MessageRecord,
    QueueHeader, SessionDescriptor, StreamId, SESSION_MAGIC, SESSION_VERSION,
};
pub use layout::{FrameSlotLayout, SlotCapacityError};
pub use queue::{Message, ProducerSession, QueueClient, QueueError, QueueHost, Subscription};
pub use region::{
    PeerId, RegionError, RegionEvent, RegionView, SharedRegion, WaitError, WaitStatus, NO_PEER,
};
