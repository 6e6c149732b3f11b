// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame capture backends
//!
//! A backend fills the frame slot it is handed; the publisher owns where that
//! slot lives. The test pattern renders in place. X11 capture receives the
//! image in a `GetImage` reply and copies it into the slot, one copy per
//! frame.

use std::io;

use lg_stream_protocol::FrameFormat;

/// What a backend wrote into the target buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Bytes per row in the target
    pub stride: u32,
    /// Frame format
    pub format: FrameFormat,
    /// Bytes written, at most `stride * height`
    pub data_length: usize,
}

impl CapturedFrame {
    /// Checks the frame fits in `capacity` bytes
    pub fn fits(&self, capacity: usize) -> bool {
        let covered = self.stride as usize * self.height as usize;
        self.data_length <= capacity && covered <= capacity && self.data_length <= covered
    }
}

/// Frame capture backend
pub trait CaptureBackend: Send {
    /// Backend name, for logging
    fn name(&self) -> &'static str;

    /// Largest frame this backend can produce in bytes
    fn max_frame_size(&self) -> usize;

    /// Pixel format of produced frames
    fn frame_format(&self) -> FrameFormat;

    /// Capture one frame into `target`
    fn grab_frame(&mut self, target: &mut [u8]) -> io::Result<CapturedFrame>;

    /// Release backend resources. Called once when the agent stops.
    fn shutdown(&mut self) {}
}

/// X11 frame capture using core `GetImage`
#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod x11 {
    use super::*;
    use x11rb::connection::Connection;
    use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
    use x11rb::rust_connection::RustConnection;

    /// X11 capture backend
    pub struct X11Capture {
        display: RustConnection,
        root: Window,
        width: u16,
        height: u16,
    }

    impl X11Capture {
        /// Connect to `$DISPLAY` and capture its default screen
        pub fn new() -> io::Result<Self> {
            let (display, screen_num) = x11rb::connect(None).map_err(|e| io::Error::other(e.to_string()))?;

            let screen = display
                .setup()
                .roots
                .get(screen_num)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Screen not found"))?;
            let root = screen.root;
            let (width, height) = (screen.width_in_pixels, screen.height_in_pixels);

            log::info!("X11 capture on screen {screen_num}: {width}x{height}");
            Ok(Self {
                display,
                root,
                width,
                height,
            })
        }
    }

    impl CaptureBackend for X11Capture {
        fn name(&self) -> &'static str {
            "x11"
        }

        fn max_frame_size(&self) -> usize {
            self.width as usize * self.height as usize * FrameFormat::Bgra.bytes_per_pixel() as usize
        }

        fn frame_format(&self) -> FrameFormat {
            FrameFormat::Bgra
        }

        fn grab_frame(&mut self, target: &mut [u8]) -> io::Result<CapturedFrame> {
            let reply = self
                .display
                .get_image(
                    ImageFormat::Z_PIXMAP,
                    self.root,
                    0,
                    0,
                    self.width,
                    self.height,
                    0xFFFF_FFFF,
                )
                .map_err(|e| io::Error::other(e.to_string()))?
                .reply()
                .map_err(|e| io::Error::other(format!("GetImage reply error: {e}")))?;

            if reply.depth != 24 && reply.depth != 32 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("Unsupported root window depth {}", reply.depth),
                ));
            }

            let stride = self.width as u32 * 4;
            let expected = stride as usize * self.height as usize;
            if reply.data.len() < expected || target.len() < expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "GetImage returned {} bytes, target holds {}, need {expected}",
                        reply.data.len(),
                        target.len()
                    ),
                ));
            }
            // The reply buffer belongs to the connection, so the image is
            // copied once into the slot.
            target[..expected].copy_from_slice(&reply.data[..expected]);

            Ok(CapturedFrame {
                width: self.width as u32,
                height: self.height as u32,
                stride,
                format: FrameFormat::Bgra,
                data_length: expected,
            })
        }
    }
}

/// Synthetic capture, available everywhere
pub mod stub {
    use super::*;

    /// Generates a moving gradient
    pub struct TestPatternCapture {
        width: u32,
        height: u32,
        format: FrameFormat,
        frame_count: u64,
    }

    impl TestPatternCapture {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                format: FrameFormat::Bgra,
                frame_count: 0,
            }
        }

        pub fn with_format(mut self, format: FrameFormat) -> Self {
            self.format = format;
            self
        }

        /// Number of frames generated so far
        pub fn frame_count(&self) -> u64 {
            self.frame_count
        }

        fn stride(&self) -> usize {
            self.width as usize * self.format.bytes_per_pixel() as usize
        }
    }

    impl CaptureBackend for TestPatternCapture {
        fn name(&self) -> &'static str {
            "test-pattern"
        }

        fn max_frame_size(&self) -> usize {
            self.stride() * self.height as usize
        }

        fn frame_format(&self) -> FrameFormat {
            self.format
        }

        fn grab_frame(&mut self, target: &mut [u8]) -> io::Result<CapturedFrame> {
            let stride = self.stride();
            let data_length = stride * self.height as usize;
            if target.len() < data_length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Target holds {} bytes, frame needs {data_length}", target.len()),
                ));
            }

            let bpp = self.format.bytes_per_pixel() as usize;
            let phase = (self.frame_count % 256) as u8;
            for (y, row) in target[..data_length].chunks_exact_mut(stride).enumerate() {
                for (x, pixel) in row.chunks_exact_mut(bpp).enumerate() {
                    pixel[0] = (x as u8).wrapping_add(phase);
                    pixel[1] = (y as u8).wrapping_add(phase);
                    pixel[2] = ((x + y) as u8).wrapping_add(phase);
                    pixel[3] = 0xFF;
                    pixel[4..].fill(0);
                }
            }

            self.frame_count += 1;

            Ok(CapturedFrame {
                width: self.width,
                height: self.height,
                stride: stride as u32,
                format: self.format,
                data_length,
            })
        }
    }
}
