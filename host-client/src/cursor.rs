// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cursor shape decoding
//!
//! Turns the shape payload of a pointer message into a 32-bit image the
//! renderer can upload. Monochrome shapes become two stacked images: the
//! AND mask in the upper half and the XOR mask in the lower half.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lg_stream_protocol::{CursorDescriptor, CursorEncoding, CursorFlags};

/// Cursor decode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown cursor encoding {0}")]
    UnknownEncoding(u32),

    #[error("Cursor payload holds {available} bytes, shape needs {needed}")]
    Truncated { needed: usize, available: usize },
}

const MASK_ALPHA: u32 = 0xFF00_0000;
const MONO_AND_SET: u32 = 0xFFFF_FFFF;
const MONO_AND_CLEAR: u32 = 0xFF00_0000;
const MONO_XOR_SET: u32 = 0x00FF_FFFF;
const MONO_XOR_CLEAR: u32 = 0;

/// Decoded cursor image.
///
/// The backing buffer only grows, so a steady stream of shapes of similar
/// size does not allocate.
#[derive(Debug, Default)]
pub struct CursorDecoder {
    buffer: Vec<u8>,
    len: usize,
    encoding: Option<CursorEncoding>,
    width: u32,
    height: u32,
    stride: usize,
}

impl CursorDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload` (the bytes after the descriptor) as described by
    /// `descriptor`. On error the previous image is kept.
    pub fn decode(&mut self, descriptor: &CursorDescriptor, payload: &[u8]) -> Result<(), DecodeError> {
        let encoding = descriptor.cursor_encoding().map_err(DecodeError::UnknownEncoding)?;
        let height = descriptor.height as usize;
        let pitch = descriptor.pitch as usize;
        let needed = height.saturating_mul(pitch);
        if payload.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: payload.len(),
            });
        }

        match encoding {
            CursorEncoding::MaskedColor => {
                let out = self.reserve(needed);
                out.copy_from_slice(&payload[..needed]);
                for pixel in out.chunks_exact_mut(4) {
                    let value = u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]);
                    let alpha = if value & MASK_ALPHA != 0 { 0 } else { MASK_ALPHA };
                    pixel.copy_from_slice(&((value & !MASK_ALPHA) | alpha).to_le_bytes());
                }
                self.stride = pitch;
            }
            CursorEncoding::Color => {
                self.reserve(needed).copy_from_slice(&payload[..needed]);
                self.stride = pitch;
            }
            CursorEncoding::Monochrome => {
                let width = descriptor.width as usize;
                if width > pitch.saturating_mul(8) {
                    return Err(DecodeError::Truncated {
                        needed: height.saturating_mul(width.div_ceil(8)),
                        available: payload.len(),
                    });
                }
                self.decode_monochrome(width, height, pitch, payload);
                self.stride = width * 4;
            }
        }

        self.encoding = Some(encoding);
        self.width = descriptor.width;
        self.height = descriptor.height;
        Ok(())
    }

    fn decode_monochrome(&mut self, width: usize, height: usize, pitch: usize, payload: &[u8]) {
        let half = height / 2;
        let out = self.reserve(width * height * 4);
        out.fill(0);

        let (and_mask, xor_mask) = payload.split_at(pitch * half);
        for y in 0..half {
            for x in 0..width {
                let bit = 0x80u8 >> (x % 8);
                let src = y * pitch + x / 8;
                let and = if and_mask[src] & bit != 0 {
                    MONO_AND_SET
                } else {
                    MONO_AND_CLEAR
                };
                let xor = if xor_mask[src] & bit != 0 {
                    MONO_XOR_SET
                } else {
                    MONO_XOR_CLEAR
                };

                let upper = (y * width + x) * 4;
                let lower = ((y + half) * width + x) * 4;
                out[upper..upper + 4].copy_from_slice(&and.to_le_bytes());
                out[lower..lower + 4].copy_from_slice(&xor.to_le_bytes());
            }
        }
    }

    fn reserve(&mut self, len: usize) -> &mut [u8] {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        self.len = len;
        &mut self.buffer[..len]
    }

    /// The decoded image, `height` rows of `stride` bytes
    pub fn image(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Size of the backing buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Encoding of the last decoded shape, `None` before the first one
    pub fn encoding(&self) -> Option<CursorEncoding> {
        self.encoding
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// Cursor state shared between the pointer worker and the presenter.
///
/// The shape is guarded by its own mutex; `version` is bumped with release
/// ordering after every successful decode so the presenter can skip the
/// lock when nothing changed.
#[derive(Debug, Default)]
pub struct CursorState {
    shape: Mutex<CursorDecoder>,
    version: AtomicU32,
    x: AtomicI32,
    y: AtomicI32,
    visible: AtomicBool,
}

impl CursorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one pointer message.
    ///
    /// Visibility and position are applied even when the shape fails to
    /// decode.
    pub fn apply(&self, flags: CursorFlags, message: &[u8]) -> Result<(), DecodeError> {
        let descriptor = CursorDescriptor::from_bytes(message).ok_or(DecodeError::Truncated {
            needed: CursorDescriptor::SIZE,
            available: message.len(),
        })?;

        self.visible
            .store(flags.contains(CursorFlags::VISIBLE), Ordering::Relaxed);
        if flags.contains(CursorFlags::POSITION) {
            self.x.store(descriptor.x, Ordering::Relaxed);
            self.y.store(descriptor.y, Ordering::Relaxed);
        }

        if flags.contains(CursorFlags::SHAPE) {
            let mut shape = self.shape();
            shape.decode(&descriptor, &message[CursorDescriptor::SIZE..])?;
            self.version.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Shape version, bumped on every decoded shape
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x.load(Ordering::Relaxed), self.y.load(Ordering::Relaxed))
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// Lock the decoded shape
    pub fn shape(&self) -> MutexGuard<'_, CursorDecoder> {
        self.shape.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(encoding: u32, width: u32, height: u32, pitch: u32) -> CursorDescriptor {
        CursorDescriptor {
            encoding,
            width,
            height,
            pitch,
            ..Default::default()
        }
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_monochrome_2x2() {
        // One AND row and one XOR row, one byte each.
        let mut decoder = CursorDecoder::new();
        let desc = descriptor(CursorEncoding::Monochrome as u32, 2, 2, 1);
        decoder.decode(&desc, &[0b1000_0000, 0b0100_0000]).unwrap();

        assert_eq!(decoder.encoding(), Some(CursorEncoding::Monochrome));
        assert_eq!(decoder.stride(), 8);
        assert_eq!(
            words(decoder.image()),
            vec![0xFFFF_FFFF, 0xFF00_0000, 0x0000_0000, 0x00FF_FFFF]
        );
    }

    #[test]
    fn test_monochrome_bits_are_msb_first() {
        let mut decoder = CursorDecoder::new();
        let desc = descriptor(CursorEncoding::Monochrome as u32, 10, 2, 2);
        decoder
            .decode(&desc, &[0b0000_0001, 0b0100_0000, 0, 0])
            .unwrap();

        let pixels = words(decoder.image());
        assert_eq!(pixels.len(), 20);
        let set: Vec<usize> = pixels[..10]
            .iter()
            .enumerate()
            .filter(|&(_, &p)| p == 0xFFFF_FFFF)
            .map(|(x, _)| x)
            .collect();
        assert_eq!(set, vec![7, 9]);
        assert!(pixels[10..].iter().all(|&p| p == 0));
    }

    #[test]
    fn test_masked_color() {
        let mut decoder = CursorDecoder::new();
        let desc = descriptor(CursorEncoding::MaskedColor as u32, 2, 1, 8);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x0012_3456u32.to_le_bytes());
        payload.extend_from_slice(&0xFF65_4321u32.to_le_bytes());

        decoder.decode(&desc, &payload).unwrap();
        assert_eq!(words(decoder.image()), vec![0xFF12_3456, 0x0065_4321]);

        // Decoding the same payload again gives the same image.
        let first = decoder.image().to_vec();
        decoder.decode(&desc, &payload).unwrap();
        assert_eq!(decoder.image(), first.as_slice());
    }

    #[test]
    fn test_color_is_copied() {
        let mut decoder = CursorDecoder::new();
        let desc = descriptor(CursorEncoding::Color as u32, 1, 2, 4);
        let payload = [1, 2, 3, 4, 5, 6, 7, 8, 9];

        decoder.decode(&desc, &payload).unwrap();
        assert_eq!(decoder.image(), &payload[..8]);
        assert_eq!(decoder.stride(), 4);
    }

    #[test]
    fn test_buffer_never_shrinks() {
        let mut decoder = CursorDecoder::new();
        decoder
            .decode(&descriptor(CursorEncoding::Color as u32, 4, 4, 16), &[0; 64])
            .unwrap();
        assert_eq!(decoder.capacity(), 64);

        decoder
            .decode(&descriptor(CursorEncoding::Color as u32, 1, 1, 4), &[7; 4])
            .unwrap();
        assert_eq!(decoder.capacity(), 64);
        assert_eq!(decoder.image(), &[7; 4]);

        decoder
            .decode(&descriptor(CursorEncoding::Color as u32, 8, 8, 32), &[0; 256])
            .unwrap();
        assert_eq!(decoder.capacity(), 256);
    }

    #[test]
    fn test_bad_payloads_keep_previous_image() {
        let mut decoder = CursorDecoder::new();
        decoder
            .decode(&descriptor(CursorEncoding::Color as u32, 1, 1, 4), &[9; 4])
            .unwrap();

        assert_eq!(
            decoder.decode(&descriptor(7, 1, 1, 4), &[0; 4]),
            Err(DecodeError::UnknownEncoding(7))
        );
        assert_eq!(
            decoder.decode(&descriptor(CursorEncoding::Color as u32, 4, 4, 16), &[0; 10]),
            Err(DecodeError::Truncated {
                needed: 64,
                available: 10
            })
        );
        assert!(matches!(
            decoder.decode(&descriptor(CursorEncoding::Monochrome as u32, 64, 2, 1), &[0; 2]),
            Err(DecodeError::Truncated { .. })
        ));

        assert_eq!(decoder.encoding(), Some(CursorEncoding::Color));
        assert_eq!(decoder.image(), &[9; 4]);
    }

    fn message(flags_desc: CursorDescriptor, shape: &[u8]) -> Vec<u8> {
        let mut bytes = flags_desc.as_bytes().to_vec();
        bytes.extend_from_slice(shape);
        bytes
    }

    #[test]
    fn test_state_applies_flags() {
        let state = CursorState::new();
        let desc = CursorDescriptor {
            x: 10,
            y: 20,
            ..descriptor(CursorEncoding::Color as u32, 1, 1, 4)
        };
        let msg = message(desc, &[1, 2, 3, 4]);

        state.apply(CursorFlags::VISIBLE | CursorFlags::POSITION, &msg).unwrap();
        assert!(state.is_visible());
        assert_eq!(state.position(), (10, 20));
        assert_eq!(state.version(), 0);

        state.apply(CursorFlags::SHAPE, &msg).unwrap();
        assert!(!state.is_visible());
        assert_eq!(state.position(), (10, 20));
        assert_eq!(state.version(), 1);
        assert_eq!(state.shape().image(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_state_ignores_undecodable_shape() {
        let state = CursorState::new();
        let desc = CursorDescriptor {
            x: 3,
            y: 4,
            ..descriptor(9, 1, 1, 4)
        };
        let msg = message(desc, &[0; 4]);

        assert_eq!(
            state.apply(CursorFlags::SHAPE | CursorFlags::POSITION, &msg),
            Err(DecodeError::UnknownEncoding(9))
        );
        assert_eq!(state.position(), (3, 4));
        assert_eq!(state.version(), 0);

        assert!(matches!(
            state.apply(CursorFlags::SHAPE, &[0; 8]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
