// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! lg-stream Guest Agent
//!
//! The producer side of an lg-stream region. Runs next to the display
//! being captured (normally inside the VM) and streams frames and cursor
//! state to the consumer through shared memory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Guest Agent                            │
//! │  - CaptureBackend ──► FramePublisher (two frame slots)      │
//! │  - CursorSource   ──► CursorPublisher (lg-cursor thread)    │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Shared Memory Region                      │
//! │  - Session descriptor                                       │
//! │  - Frame and pointer queues                                 │
//! │  - Frame descriptors and frame slots                        │
//! │  - Cursor payload ring                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Host Client                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lg_guest_agent::{AgentConfig, GuestAgent};
//!
//! let mut agent = GuestAgent::new(AgentConfig::default())?;
//! agent.start()?;
//!
//! loop {
//!     agent.run_iteration()?;
//! }
//! ```
//!
//! # Modules
//!
//! - [`capture`]: Frame capture backends
//! - [`cursor`]: Cursor sources
//! - [`slots`]: Frame slot state tracking
//! - [`publisher`]: Frame publisher
//! - [`pointer`]: Cursor publisher

pub mod agent;
pub mod capture;
pub mod cursor;
pub mod pointer;
pub mod publisher;
pub mod slots;

pub use agent::{AgentConfig, AgentError, CaptureKind, GuestAgent, RunSummary};
pub use capture::{CaptureBackend, CapturedFrame};
pub use cursor::{CursorShape, CursorSource};
pub use publisher::{FramePublisher, PublishError, PublishedFrame};
