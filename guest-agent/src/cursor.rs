// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cursor sources
//!
//! Provides cursor position, visibility and shape to the cursor publisher.

use std::io;

use lg_stream_protocol::CursorEncoding;

/// Cursor shape data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Encoding of `data`
    pub encoding: CursorEncoding,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels (both masks for monochrome)
    pub height: u32,
    /// Bytes per row of `data`
    pub pitch: u32,
    /// Hotspot X
    pub hot_x: i32,
    /// Hotspot Y
    pub hot_y: i32,
    /// Shape bytes, `pitch * height`
    pub data: Vec<u8>,
}

/// Cursor source trait
pub trait CursorSource: Send {
    /// Get cursor position
    fn position(&mut self) -> io::Result<(i32, i32)>;

    /// Check if cursor is visible
    fn is_visible(&self) -> bool;

    /// Get the cursor shape if it changed since the last call
    fn poll_shape(&mut self) -> io::Result<Option<CursorShape>>;
}

/// X11 cursor source using XFixes
#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod x11_cursor {
    use super::*;
    use x11rb::connection::Connection;
    use x11rb::protocol::xfixes::ConnectionExt as XfixesExt;
    use x11rb::protocol::xproto::{ConnectionExt as XprotoExt, Window};
    use x11rb::rust_connection::RustConnection;

    pub struct X11CursorSource {
        display: RustConnection,
        root: Window,
        last_cursor_serial: Option<u32>,
    }

    impl X11CursorSource {
        pub fn new() -> io::Result<Self> {
            let (display, screen_num) = x11rb::connect(None).map_err(|e| io::Error::other(e.to_string()))?;

            let root = display
                .setup()
                .roots
                .get(screen_num)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Screen not found"))?
                .root;

            // XFixes must be version-negotiated before any other request.
            let version = display
                .xfixes_query_version(4, 0)
                .map_err(|e| io::Error::other(e.to_string()))?
                .reply()
                .map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("XFixes extension not available: {e}"),
                    )
                })?;
            log::debug!(
                "XFixes {}.{}",
                version.major_version,
                version.minor_version
            );

            Ok(Self {
                display,
                root,
                last_cursor_serial: None,
            })
        }
    }

    impl CursorSource for X11CursorSource {
        fn position(&mut self) -> io::Result<(i32, i32)> {
            let reply = self
                .display
                .query_pointer(self.root)
                .map_err(|e| io::Error::other(e.to_string()))?
                .reply()
                .map_err(|e| io::Error::other(e.to_string()))?;

            Ok((reply.root_x as i32, reply.root_y as i32))
        }

        fn is_visible(&self) -> bool {
            // X11 has no query for a hidden cursor
            true
        }

        fn poll_shape(&mut self) -> io::Result<Option<CursorShape>> {
            let reply = self
                .display
                .xfixes_get_cursor_image()
                .map_err(|e| io::Error::other(e.to_string()))?
                .reply()
                .map_err(|e| io::Error::other(e.to_string()))?;

            if self.last_cursor_serial == Some(reply.cursor_serial) {
                return Ok(None);
            }
            self.last_cursor_serial = Some(reply.cursor_serial);

            // XFixes pixels are premultiplied ARGB words, which is BGRA in
            // little-endian byte order.
            let data: Vec<u8> = reply
                .cursor_image
                .iter()
                .flat_map(|pixel| pixel.to_le_bytes())
                .collect();

            Ok(Some(CursorShape {
                encoding: CursorEncoding::Color,
                width: reply.width as u32,
                height: reply.height as u32,
                pitch: reply.width as u32 * 4,
                hot_x: reply.xhot as i32,
                hot_y: reply.yhot as i32,
                data,
            }))
        }
    }
}

/// Stub cursor source
pub mod stub_cursor {
    use super::*;

    /// Size of the stub arrow
    const ARROW_SIZE: u32 = 32;

    /// Reports a fixed arrow once and a position sweeping along the diagonal
    pub struct StubCursorSource {
        x: i32,
        y: i32,
        bounds: (i32, i32),
        shape_sent: bool,
    }

    impl StubCursorSource {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                x: 0,
                y: 0,
                bounds: (width.max(1) as i32, height.max(1) as i32),
                shape_sent: false,
            }
        }

        /// The arrow shape reported on the first poll
        pub fn arrow() -> CursorShape {
            let size = ARROW_SIZE as usize;
            let mut data = vec![0u8; size * size * 4];
            for y in 0..size {
                for x in 0..=y.min(size / 2) {
                    let offset = (y * size + x) * 4;
                    data[offset..offset + 4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                }
            }

            CursorShape {
                encoding: CursorEncoding::Color,
                width: ARROW_SIZE,
                height: ARROW_SIZE,
                pitch: ARROW_SIZE * 4,
                hot_x: 0,
                hot_y: 0,
                data,
            }
        }
    }

    impl CursorSource for StubCursorSource {
        fn position(&mut self) -> io::Result<(i32, i32)> {
            let current = (self.x, self.y);
            self.x = (self.x + 1) % self.bounds.0;
            self.y = (self.y + 1) % self.bounds.1;
            Ok(current)
        }

        fn is_visible(&self) -> bool {
            true
        }

        fn poll_shape(&mut self) -> io::Result<Option<CursorShape>> {
            if self.shape_sent {
                return Ok(None);
            }
            self.shape_sent = true;
            Ok(Some(Self::arrow()))
        }
    }
}
