// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Presentation synchronizer
//!
//! Runs once per render tick. Takes the frame gate, refreshes the cursor
//! image when its version moved, then copies the newest frame into the
//! renderer surface. The frame message is completed and the gate released
//! on every path, including renderer failures.

use std::time::Duration;

use log::{debug, warn};

use lg_stream_protocol::{
    CursorEncoding, FrameDescriptor, FrameFormat, Message, QueueError, RegionError, Subscription,
};

use crate::cursor::CursorState;
use crate::render::{CursorId, CursorKind, RenderBackend, RenderError, SurfaceId};
use crate::sync::Semaphore;

/// Presentation errors
#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    #[error("Frame queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Frame data error: {0}")]
    Region(#[from] RegionError),

    #[error("Renderer error: {0}")]
    Render(#[from] RenderError),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl PresentError {
    /// Errors after which the frame stream can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, PresentError::Queue(_))
    }
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The session is not running
    Idle,
    /// The frame gate could not be taken in time
    Busy,
    /// No new frame
    NoFrame,
    /// A frame was copied into the surface
    Presented { message: u32, width: u32, height: u32 },
}

/// Cursor overlay for the current tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOverlay {
    pub cursor: Option<CursorId>,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
}

/// Shared state a tick reads
pub struct TickContext<'a> {
    pub frames: &'a Subscription,
    pub gate: &'a Semaphore,
    pub cursor: &'a CursorState,
    pub running: &'a dyn Fn() -> bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SurfaceShape {
    format: FrameFormat,
    width: u32,
    height: u32,
    format_version: u32,
}

/// Renderer-side presentation state
#[derive(Debug)]
pub struct Presenter {
    gate_timeout: Duration,
    surface: Option<(SurfaceId, SurfaceShape)>,
    cursor_version: u32,
    overlay: CursorOverlay,
}

impl Presenter {
    pub fn new(gate_timeout: Duration) -> Self {
        Self {
            gate_timeout,
            surface: None,
            cursor_version: 0,
            overlay: CursorOverlay::default(),
        }
    }

    /// Current frame surface
    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface.map(|(id, _)| id)
    }

    pub fn overlay(&self) -> CursorOverlay {
        self.overlay
    }

    /// Present the newest frame, if any
    pub fn tick(
        &mut self,
        ctx: &TickContext<'_>,
        renderer: &mut dyn RenderBackend,
    ) -> Result<TickOutcome, PresentError> {
        let Some(_permit) = ctx.gate.acquire_timeout(self.gate_timeout) else {
            return Ok(TickOutcome::Busy);
        };
        if !(ctx.running)() {
            return Ok(TickOutcome::Idle);
        }

        let (x, y) = ctx.cursor.position();
        self.overlay.x = x;
        self.overlay.y = y;
        self.overlay.visible = ctx.cursor.is_visible();

        let version = ctx.cursor.version();
        if version != self.cursor_version {
            self.update_cursor(ctx.cursor, renderer);
            self.cursor_version = version;
        }

        match ctx.frames.advance_to_newest() {
            Ok(_) => {}
            Err(QueueError::Empty) => return Ok(TickOutcome::NoFrame),
            Err(e) => return Err(e.into()),
        }
        let message = ctx.frames.receive_next()?;
        let index = message.index();

        let presented = self.present_frame(ctx.frames, &message, renderer);
        ctx.frames.complete_message(message)?;

        let (width, height) = presented?;
        Ok(TickOutcome::Presented {
            message: index,
            width,
            height,
        })
    }

    fn update_cursor(&mut self, cursor: &CursorState, renderer: &mut dyn RenderBackend) {
        let shape = cursor.shape();

        if let Some(id) = self.overlay.cursor.take() {
            if let Err(e) = renderer.destroy_cursor(id) {
                warn!("Failed to destroy cursor {id}: {e}");
            }
        }

        let kind = match shape.encoding() {
            Some(CursorEncoding::Monochrome) => CursorKind::Monochrome,
            Some(CursorEncoding::Color | CursorEncoding::MaskedColor) => CursorKind::Color,
            None => return,
        };
        match renderer.create_cursor(shape.width(), shape.height(), shape.stride(), kind, shape.image()) {
            Ok(id) => {
                debug!("Cursor {id}: {}x{} {kind:?}", shape.width(), shape.height());
                self.overlay.cursor = Some(id);
                self.overlay.width = shape.width();
                self.overlay.height = shape.height();
            }
            Err(e) => warn!("Failed to create cursor: {e}"),
        }
    }

    fn present_frame(
        &mut self,
        frames: &Subscription,
        message: &Message<'_>,
        renderer: &mut dyn RenderBackend,
    ) -> Result<(u32, u32), PresentError> {
        let view = frames.view();
        let descriptor: FrameDescriptor = view.read(message.offset())?;
        let format = descriptor
            .frame_format()
            .map_err(|_| PresentError::InvalidFrame(format!("format {}", descriptor.format)))?;

        if descriptor.data_length == 0 {
            return Err(PresentError::InvalidFrame("empty frame".to_string()));
        }
        let row_bytes = descriptor.width as usize * format.bytes_per_pixel() as usize;
        let src_stride = descriptor.stride as usize;
        if descriptor.width == 0 || descriptor.height == 0 || src_stride < row_bytes {
            return Err(PresentError::InvalidFrame(format!(
                "{}x{} stride {}",
                descriptor.width, descriptor.height, descriptor.stride
            )));
        }
        if descriptor.covered_bytes() > descriptor.data_length {
            return Err(PresentError::InvalidFrame(format!(
                "{} rows of {src_stride} bytes exceed {} bytes of data",
                descriptor.height, descriptor.data_length
            )));
        }
        let data_offset = usize::try_from(descriptor.data_offset)
            .map_err(|_| PresentError::InvalidFrame(format!("offset {:#x}", descriptor.data_offset)))?;
        let data_length = usize::try_from(descriptor.data_length)
            .map_err(|_| PresentError::InvalidFrame(format!("length {}", descriptor.data_length)))?;
        let src = view.bytes(data_offset, data_length)?;

        let shape = SurfaceShape {
            format,
            width: descriptor.width,
            height: descriptor.height,
            format_version: descriptor.format_version,
        };
        let surface = self.ensure_surface(shape, renderer)?;

        let mut mapped = renderer.map_for_write(surface)?;
        let dst_stride = mapped.stride;
        let rows = descriptor.height as usize;
        let copied = if dst_stride < row_bytes || mapped.data.len() < (rows - 1) * dst_stride + row_bytes {
            Err(PresentError::InvalidFrame(format!(
                "surface stride {dst_stride} cannot hold {row_bytes} byte rows"
            )))
        } else {
            for (dst, src) in mapped
                .data
                .chunks_mut(dst_stride)
                .zip(src.chunks(src_stride))
                .take(rows)
            {
                dst[..row_bytes].copy_from_slice(&src[..row_bytes]);
            }
            Ok(())
        };
        renderer.unmap(surface)?;
        copied?;

        Ok((descriptor.width, descriptor.height))
    }

    fn ensure_surface(
        &mut self,
        shape: SurfaceShape,
        renderer: &mut dyn RenderBackend,
    ) -> Result<SurfaceId, PresentError> {
        if let Some((id, current)) = self.surface {
            if current == shape {
                return Ok(id);
            }
            self.surface = None;
            if let Err(e) = renderer.destroy_surface(id) {
                warn!("Failed to destroy surface {id}: {e}");
            }
        }

        let id = renderer.create_surface(shape.width, shape.height, shape.format)?;
        debug!(
            "Surface {id}: {}x{} {:?} (format version {})",
            shape.width, shape.height, shape.format, shape.format_version
        );
        self.surface = Some((id, shape));
        Ok(id)
    }

    /// Destroy the surface and cursor image
    pub fn release(&mut self, renderer: &mut dyn RenderBackend) {
        if let Some((id, _)) = self.surface.take() {
            if let Err(e) = renderer.destroy_surface(id) {
                warn!("Failed to destroy surface {id}: {e}");
            }
        }
        if let Some(id) = self.overlay.cursor.take() {
            if let Err(e) = renderer.destroy_cursor(id) {
                warn!("Failed to destroy cursor {id}: {e}");
            }
        }
        self.cursor_version = 0;
    }
}
