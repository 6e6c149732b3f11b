// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Renderer backend abstraction
//!
//! The presenter drives a [`RenderBackend`] to keep one frame surface and
//! one cursor image up to date. Real applications plug in their graphics
//! API here; [`HeadlessRenderer`] keeps everything in CPU memory and is used
//! by the CLI and the tests.

use std::collections::HashMap;
use std::fmt;

use lg_stream_protocol::layout::align_up;
use lg_stream_protocol::FrameFormat;

/// Result type for renderer operations
pub type Result<T> = std::result::Result<T, RenderError>;

/// Renderer errors
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The surface ID does not name a live surface
    #[error("Unknown surface {0}")]
    UnknownSurface(SurfaceId),

    /// The cursor ID does not name a live cursor image
    #[error("Unknown cursor {0}")]
    UnknownCursor(CursorId),

    /// Zero or overflowing dimensions
    #[error("Invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    /// Cursor image smaller than its dimensions require
    #[error("Cursor image holds {len} bytes, {needed} required")]
    ShortImage { len: usize, needed: usize },

    /// The surface is not mapped
    #[error("Surface {0} is not mapped")]
    NotMapped(SurfaceId),

    /// Failure reported by the graphics API
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Handle of a frame surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a cursor image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CursorId(pub u32);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a cursor image is composited
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorKind {
    /// Alpha-blended 32-bit colour
    Color,
    /// Stacked AND/XOR images; the upper half is the AND mask
    Monochrome,
}

/// Writable view of a mapped surface
#[derive(Debug)]
pub struct MappedSurface<'a> {
    /// Surface memory, `height` rows of `stride` bytes
    pub data: &'a mut [u8],
    /// Bytes per destination row
    pub stride: usize,
}

/// Renderer backend trait.
///
/// All methods are called from the render thread only.
pub trait RenderBackend {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a frame surface.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidSize`] for empty dimensions.
    fn create_surface(&mut self, width: u32, height: u32, format: FrameFormat) -> Result<SurfaceId>;

    /// Map a surface for CPU writes.
    ///
    /// The destination stride is chosen by the backend and may differ from
    /// the source stride.
    fn map_for_write(&mut self, surface: SurfaceId) -> Result<MappedSurface<'_>>;

    /// Finish writing a mapped surface.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NotMapped`] if the surface is not mapped.
    fn unmap(&mut self, surface: SurfaceId) -> Result<()>;

    /// Destroy a surface, unmapping it first if needed.
    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()>;

    /// Create a cursor image from `height` rows of `stride` bytes.
    ///
    /// [`CursorKind::Monochrome`] images arrive uncomposited: the upper half
    /// holds the AND mask and the lower half the XOR mask. The backend owns
    /// applying them against the frame, AND first and then XOR, the way a
    /// logic-op blend would.
    fn create_cursor(
        &mut self,
        width: u32,
        height: u32,
        stride: usize,
        kind: CursorKind,
        data: &[u8],
    ) -> Result<CursorId>;

    /// Destroy a cursor image.
    fn destroy_cursor(&mut self, cursor: CursorId) -> Result<()>;
}

/// CPU-side surface of the [`HeadlessRenderer`]
#[derive(Debug)]
pub struct HeadlessSurface {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub stride: usize,
    pub data: Vec<u8>,
    pub mapped: bool,
}

impl HeadlessSurface {
    /// One row of pixels, without the stride padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        &self.data[start..start + len]
    }
}

/// CPU-side cursor of the [`HeadlessRenderer`]
#[derive(Debug)]
pub struct HeadlessCursor {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub kind: CursorKind,
    pub data: Vec<u8>,
}

/// Call counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub surfaces_created: u64,
    pub surfaces_destroyed: u64,
    pub surfaces_written: u64,
    pub cursors_created: u64,
    pub cursors_destroyed: u64,
}

/// Row alignment of headless surfaces, as GPU uploads usually require
pub const HEADLESS_ROW_ALIGN: usize = 256;

/// Renderer that keeps surfaces and cursors in memory
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    surfaces: HashMap<SurfaceId, HeadlessSurface>,
    cursors: HashMap<CursorId, HeadlessCursor>,
    next_id: u32,
    stats: RenderStats,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    pub fn surface(&self, surface: SurfaceId) -> Option<&HeadlessSurface> {
        self.surfaces.get(&surface)
    }

    pub fn cursor(&self, cursor: CursorId) -> Option<&HeadlessCursor> {
        self.cursors.get(&cursor)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }
}

impl RenderBackend for HeadlessRenderer {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_surface(&mut self, width: u32, height: u32, format: FrameFormat) -> Result<SurfaceId> {
        let row = (width as usize).checked_mul(format.bytes_per_pixel() as usize);
        let stride = row.map(|row| align_up(row, HEADLESS_ROW_ALIGN));
        let size = stride.and_then(|stride| stride.checked_mul(height as usize));
        let (Some(stride), Some(size)) = (stride, size) else {
            return Err(RenderError::InvalidSize { width, height });
        };
        if size == 0 {
            return Err(RenderError::InvalidSize { width, height });
        }

        let id = SurfaceId(self.allocate_id());
        self.surfaces.insert(
            id,
            HeadlessSurface {
                width,
                height,
                format,
                stride,
                data: vec![0; size],
                mapped: false,
            },
        );
        self.stats.surfaces_created += 1;
        Ok(id)
    }

    fn map_for_write(&mut self, surface: SurfaceId) -> Result<MappedSurface<'_>> {
        let entry = self
            .surfaces
            .get_mut(&surface)
            .ok_or(RenderError::UnknownSurface(surface))?;
        entry.mapped = true;
        Ok(MappedSurface {
            data: &mut entry.data,
            stride: entry.stride,
        })
    }

    fn unmap(&mut self, surface: SurfaceId) -> Result<()> {
        let entry = self
            .surfaces
            .get_mut(&surface)
            .ok_or(RenderError::UnknownSurface(surface))?;
        if !entry.mapped {
            return Err(RenderError::NotMapped(surface));
        }
        entry.mapped = false;
        self.stats.surfaces_written += 1;
        Ok(())
    }

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()> {
        self.surfaces
            .remove(&surface)
            .ok_or(RenderError::UnknownSurface(surface))?;
        self.stats.surfaces_destroyed += 1;
        Ok(())
    }

    fn create_cursor(
        &mut self,
        width: u32,
        height: u32,
        stride: usize,
        kind: CursorKind,
        data: &[u8],
    ) -> Result<CursorId> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidSize { width, height });
        }
        let needed = stride.saturating_mul(height as usize);
        if data.len() < needed {
            return Err(RenderError::ShortImage {
                len: data.len(),
                needed,
            });
        }

        let id = CursorId(self.allocate_id());
        self.cursors.insert(
            id,
            HeadlessCursor {
                width,
                height,
                stride,
                kind,
                data: data[..needed].to_vec(),
            },
        );
        self.stats.cursors_created += 1;
        Ok(id)
    }

    fn destroy_cursor(&mut self, cursor: CursorId) -> Result<()> {
        self.cursors
            .remove(&cursor)
            .ok_or(RenderError::UnknownCursor(cursor))?;
        self.stats.cursors_destroyed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_lifecycle() {
        let mut renderer = HeadlessRenderer::new();
        let id = renderer.create_surface(10, 4, FrameFormat::Bgra).unwrap();

        let mut mapped = renderer.map_for_write(id).unwrap();
        assert_eq!(mapped.stride, HEADLESS_ROW_ALIGN);
        assert_eq!(mapped.data.len(), HEADLESS_ROW_ALIGN * 4);
        mapped.data[..4].copy_from_slice(&[1, 2, 3, 4]);
        renderer.unmap(id).unwrap();
        assert!(matches!(renderer.unmap(id), Err(RenderError::NotMapped(_))));

        let surface = renderer.surface(id).unwrap();
        assert_eq!(surface.row(0)[..4], [1, 2, 3, 4]);
        assert_eq!(surface.row(0).len(), 40);

        renderer.destroy_surface(id).unwrap();
        assert!(matches!(
            renderer.destroy_surface(id),
            Err(RenderError::UnknownSurface(_))
        ));
        assert_eq!(
            renderer.stats(),
            &RenderStats {
                surfaces_created: 1,
                surfaces_destroyed: 1,
                surfaces_written: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_wide_formats_get_wider_rows() {
        let mut renderer = HeadlessRenderer::new();
        let id = renderer.create_surface(64, 1, FrameFormat::Rgba16F).unwrap();
        assert_eq!(renderer.surface(id).unwrap().stride, 512);
    }

    #[test]
    fn test_invalid_sizes() {
        let mut renderer = HeadlessRenderer::new();
        assert!(matches!(
            renderer.create_surface(0, 10, FrameFormat::Bgra),
            Err(RenderError::InvalidSize { .. })
        ));
        assert!(matches!(
            renderer.create_cursor(0, 1, 4, CursorKind::Color, &[]),
            Err(RenderError::InvalidSize { .. })
        ));
        assert!(matches!(
            renderer.create_cursor(2, 2, 8, CursorKind::Color, &[0; 8]),
            Err(RenderError::ShortImage { len: 8, needed: 16 })
        ));
        assert_eq!(renderer.surface_count(), 0);
        assert_eq!(renderer.cursor_count(), 0);
    }

    #[test]
    fn test_cursor_lifecycle() {
        let mut renderer = HeadlessRenderer::new();
        let id = renderer
            .create_cursor(1, 2, 4, CursorKind::Monochrome, &[7; 12])
            .unwrap();

        let cursor = renderer.cursor(id).unwrap();
        assert_eq!(cursor.kind, CursorKind::Monochrome);
        assert_eq!(cursor.data, vec![7; 8]);

        renderer.destroy_cursor(id).unwrap();
        assert!(renderer.cursor(id).is_none());
        assert!(matches!(
            renderer.destroy_cursor(id),
            Err(RenderError::UnknownCursor(_))
        ));
    }
}
