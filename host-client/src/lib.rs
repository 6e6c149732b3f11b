// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! lg-stream Host Client
//!
//! The consumer side of an lg-stream region. Attaches to the session a
//! guest agent published, keeps the frame stream drained to its newest
//! frame, applies cursor updates, and presents frames through a
//! [`RenderBackend`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Shared Memory Region                      │
//! └─────────────────────────────────────────────────────────────┘
//!          │ frame stream                   │ pointer stream
//!          ▼                                ▼
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │ lg-frame worker      │      │ lg-pointer worker            │
//! │  advance to newest   │      │  decode shape, track position│
//! └──────────────────────┘      └──────────────────────────────┘
//!          │ frame gate                     │ CursorState
//!          ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Presenter (render tick)                      │
//! │  - Surface sized to the frame, reallocated on format change │
//! │  - Cursor image recreated when its version moves            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!                      RenderBackend
//! ```
//!
//! # Modules
//!
//! - [`session`]: Consumer session and worker threads
//! - [`present`]: Render tick
//! - [`cursor`]: Cursor shape decoding
//! - [`render`]: Rendering backend interface
//! - [`sync`]: Frame gate

pub mod cursor;
pub mod present;
pub mod render;
pub mod session;
pub mod sync;

pub use cursor::{CursorDecoder, CursorState, DecodeError};
pub use present::{PresentError, Presenter, TickOutcome};
pub use render::{HeadlessRenderer, RenderBackend, RenderError};
pub use session::{ClientConfig, SessionError, SessionState, StreamSession};
