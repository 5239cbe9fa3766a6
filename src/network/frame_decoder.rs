// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stream de-multiplexing.
//!
//! A [`FrameDecoder`] owns an accumulating buffer and turns an unbounded byte
//! stream into complete frames, regardless of how the peer's writes were split
//! or coalesced by the transport. Three decoders are provided:
//!
//! - [`LengthFieldFrameDecoder`]: frames carry their own length in a header field
//! - [`LineFrameDecoder`]: frames end with `\n` or `\r\n`
//! - [`DelimiterFrameDecoder`]: frames end with one of several delimiters
//!
//! A decoder is not thread-safe by itself; each connection owns one instance and
//! its single reader task serializes calls.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Describes where a frame's length lives and how to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthField {
    pub byte_order: ByteOrder,
    /// frames longer than this are discarded
    pub max_frame_length: u64,
    /// byte offset of the length field within the frame
    pub length_field_offset: usize,
    /// width of the length field: 1, 2, 3, 4 or 8 bytes
    pub length_field_length: usize,
    /// added to the raw length value to get the number of bytes after the length field
    pub length_adjustment: i64,
    /// bytes removed from the front of every emitted frame
    pub initial_bytes_to_strip: usize,
}

impl LengthField {
    pub fn new(
        byte_order: ByteOrder,
        max_frame_length: u64,
        length_field_offset: usize,
        length_field_length: usize,
        length_adjustment: i64,
        initial_bytes_to_strip: usize,
    ) -> Self {
        Self {
            byte_order,
            max_frame_length,
            length_field_offset,
            length_field_length,
            length_adjustment,
            initial_bytes_to_strip,
        }
    }

    pub fn length_field_end_offset(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }

    pub fn validate(&self) -> AppResult<()> {
        if !matches!(self.length_field_length, 1 | 2 | 3 | 4 | 8) {
            return Err(AppError::InvalidValue(format!(
                "unsupported length field length: {} (expected: 1, 2, 3, 4, or 8)",
                self.length_field_length
            )));
        }
        if self.max_frame_length == 0 {
            return Err(AppError::InvalidValue(
                "max frame length must be a positive integer".to_string(),
            ));
        }
        if self.length_field_end_offset() as u64 > self.max_frame_length {
            return Err(AppError::InvalidValue(format!(
                "max frame length ({}) must be equal to or greater than length field offset ({}) + length field length ({})",
                self.max_frame_length, self.length_field_offset, self.length_field_length
            )));
        }
        Ok(())
    }

    /// Reads the raw length value. `field` must hold at least
    /// `length_field_length` bytes.
    fn read_length(&self, mut field: &[u8]) -> i64 {
        let value = match self.byte_order {
            ByteOrder::BigEndian => field.get_uint(self.length_field_length),
            ByteOrder::LittleEndian => field.get_uint_le(self.length_field_length),
        };
        // only an 8-byte field can produce a value above i64::MAX
        value as i64
    }
}

pub trait FrameDecoder: Send {
    /// The accumulating input buffer.
    fn buffer(&mut self) -> &mut BytesMut;

    /// Extracts the next complete frame from the buffer.
    ///
    /// `Ok(None)` means more input is needed. An error reports a frame that has
    /// been dropped; the buffer has already advanced past it, so decoding can
    /// continue with the next call.
    fn decode_frame(&mut self) -> AppResult<Option<Bytes>>;

    /// Appends `input` and returns every frame completed by it, in order.
    /// Framing errors are logged and the offending bytes dropped.
    fn decode(&mut self, input: &[u8]) -> Vec<Bytes> {
        self.buffer().extend_from_slice(input);
        let mut frames = Vec::new();
        loop {
            match self.decode_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) if err.is_frame_error() => warn!("frame dropped: {}", err),
                Err(err) => {
                    error!("decoder failed: {}", err);
                    break;
                }
            }
        }
        trace!(
            frames = frames.len(),
            remaining = self.buffer().len(),
            "decode finished"
        );
        frames
    }
}

/// Splits the stream by the value of a length field in each frame's header.
#[derive(Debug)]
pub struct LengthFieldFrameDecoder {
    length_field: LengthField,
    length_field_end_offset: usize,
    fail_fast: bool,
    buffer: BytesMut,
    discarding_too_long_frame: bool,
    too_long_frame_length: u64,
    bytes_to_discard: u64,
}

impl LengthFieldFrameDecoder {
    /// # Panics
    ///
    /// Panics if `length_field` is invalid, e.g. an unsupported field width.
    /// That is a configuration error and must surface at startup.
    pub fn new(length_field: LengthField) -> Self {
        if let Err(err) = length_field.validate() {
            panic!("invalid length field: {err}");
        }
        Self {
            length_field_end_offset: length_field.length_field_end_offset(),
            length_field,
            fail_fast: true,
            buffer: BytesMut::new(),
            discarding_too_long_frame: false,
            too_long_frame_length: 0,
            bytes_to_discard: 0,
        }
    }

    /// With `fail_fast` the too-long error is raised as soon as the length
    /// field is read; otherwise only after the whole frame has been skipped.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn length_field(&self) -> &LengthField {
        &self.length_field
    }

    fn discard_buffered(&mut self) -> AppResult<()> {
        let local = self.bytes_to_discard.min(self.buffer.len() as u64);
        self.buffer.advance(local as usize);
        self.bytes_to_discard -= local;
        self.fail_if_necessary(false)
    }

    fn exceeded_frame_length(&mut self, frame_length: u64) -> AppResult<()> {
        let buffered = self.buffer.len() as u64;
        self.too_long_frame_length = frame_length;
        if frame_length <= buffered {
            self.buffer.advance(frame_length as usize);
        } else {
            self.discarding_too_long_frame = true;
            self.bytes_to_discard = frame_length - buffered;
            self.buffer.clear();
        }
        self.fail_if_necessary(true)
    }

    fn fail_if_necessary(&mut self, first_detection: bool) -> AppResult<()> {
        if self.bytes_to_discard == 0 {
            let too_long_frame_length = std::mem::take(&mut self.too_long_frame_length);
            self.discarding_too_long_frame = false;
            if !self.fail_fast || first_detection {
                return Err(self.too_long(too_long_frame_length));
            }
        } else if self.fail_fast && first_detection {
            return Err(self.too_long(self.too_long_frame_length));
        }
        Ok(())
    }

    fn too_long(&self, length: u64) -> AppError {
        AppError::FrameTooLong {
            length,
            max: self.length_field.max_frame_length,
        }
    }
}

impl FrameDecoder for LengthFieldFrameDecoder {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    fn decode_frame(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            if self.discarding_too_long_frame {
                self.discard_buffered()?;
            }

            // half header
            if self.buffer.len() < self.length_field_end_offset {
                return Ok(None);
            }

            let offset = self.length_field.length_field_offset;
            let raw_length = self
                .length_field
                .read_length(&self.buffer[offset..self.length_field_end_offset]);
            if raw_length < 0 {
                self.buffer.advance(self.length_field_end_offset);
                return Err(AppError::NegativeLength(raw_length));
            }

            let frame_length = raw_length
                .saturating_add(self.length_field.length_adjustment)
                .saturating_add(self.length_field_end_offset as i64);
            if frame_length < self.length_field_end_offset as i64 {
                self.buffer.advance(self.length_field_end_offset);
                return Err(AppError::CorruptedFrame(format!(
                    "adjusted frame length ({}) is less than length field end offset: {}",
                    frame_length, self.length_field_end_offset
                )));
            }
            let frame_length = frame_length as u64;

            if frame_length > self.length_field.max_frame_length {
                self.exceeded_frame_length(frame_length)?;
                continue;
            }

            // half frame
            let frame_length = frame_length as usize;
            if self.buffer.len() < frame_length {
                return Ok(None);
            }

            let strip = self.length_field.initial_bytes_to_strip;
            if strip > frame_length {
                self.buffer.advance(frame_length);
                return Err(AppError::CorruptedFrame(format!(
                    "adjusted frame length ({}) is less than initial bytes to strip: {}",
                    frame_length, strip
                )));
            }

            let mut frame = self.buffer.split_to(frame_length).freeze();
            frame.advance(strip);
            return Ok(Some(frame));
        }
    }
}

/// Splits the stream on `\n` or `\r\n`.
#[derive(Debug)]
pub struct LineFrameDecoder {
    max_length: usize,
    strip_delimiter: bool,
    fail_fast: bool,
    buffer: BytesMut,
    discarding: bool,
    discarded_bytes: usize,
    // where the previous scan for a line end stopped
    offset: usize,
}

impl LineFrameDecoder {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            strip_delimiter: true,
            fail_fast: false,
            buffer: BytesMut::new(),
            discarding: false,
            discarded_bytes: 0,
            offset: 0,
        }
    }

    pub fn with_strip_delimiter(mut self, strip_delimiter: bool) -> Self {
        self.strip_delimiter = strip_delimiter;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Index of the line end, pointing at `\r` when the line ends with `\r\n`.
    fn find_end_of_line(&mut self) -> Option<usize> {
        match self.buffer[self.offset..].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let i = self.offset + pos;
                self.offset = 0;
                if i > 0 && self.buffer[i - 1] == b'\r' {
                    Some(i - 1)
                } else {
                    Some(i)
                }
            }
            None => {
                self.offset = self.buffer.len();
                None
            }
        }
    }

    fn too_long(&self, length: usize) -> AppError {
        AppError::FrameTooLong {
            length: length as u64,
            max: self.max_length as u64,
        }
    }
}

impl FrameDecoder for LineFrameDecoder {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    fn decode_frame(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            let eol = self.find_end_of_line();
            if !self.discarding {
                return match eol {
                    Some(eol) => {
                        let delim_length = if self.buffer[eol] == b'\r' { 2 } else { 1 };
                        if eol > self.max_length {
                            self.buffer.advance(eol + delim_length);
                            return Err(self.too_long(eol));
                        }
                        let frame = if self.strip_delimiter {
                            let frame = self.buffer.split_to(eol).freeze();
                            self.buffer.advance(delim_length);
                            frame
                        } else {
                            self.buffer.split_to(eol + delim_length).freeze()
                        };
                        Ok(Some(frame))
                    }
                    None => {
                        let length = self.buffer.len();
                        if length > self.max_length {
                            self.discarded_bytes = length;
                            self.buffer.clear();
                            self.discarding = true;
                            self.offset = 0;
                            if self.fail_fast {
                                return Err(self.too_long(length));
                            }
                        }
                        Ok(None)
                    }
                };
            }

            match eol {
                Some(eol) => {
                    let delim_length = if self.buffer[eol] == b'\r' { 2 } else { 1 };
                    let length = self.discarded_bytes + eol;
                    self.buffer.advance(eol + delim_length);
                    self.discarded_bytes = 0;
                    self.discarding = false;
                    if !self.fail_fast {
                        return Err(self.too_long(length));
                    }
                }
                None => {
                    self.discarded_bytes += self.buffer.len();
                    self.buffer.clear();
                    self.offset = 0;
                    return Ok(None);
                }
            }
        }
    }
}

/// Splits the stream on the earliest match of any of the configured
/// delimiters.
#[derive(Debug)]
pub struct DelimiterFrameDecoder {
    delimiters: Vec<Bytes>,
    max_frame_length: usize,
    strip_delimiter: bool,
    fail_fast: bool,
    buffer: BytesMut,
    discarding_too_long_frame: bool,
    too_long_frame_length: usize,
}

impl DelimiterFrameDecoder {
    /// # Panics
    ///
    /// Panics when no delimiter is given or a delimiter is empty.
    pub fn new<I, D>(max_frame_length: usize, delimiters: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Bytes>,
    {
        let delimiters: Vec<Bytes> = delimiters.into_iter().map(Into::into).collect();
        assert!(!delimiters.is_empty(), "delimiters must not be empty");
        assert!(
            delimiters.iter().all(|d| !d.is_empty()),
            "empty delimiter is not allowed"
        );
        Self {
            delimiters,
            max_frame_length,
            strip_delimiter: true,
            fail_fast: true,
            buffer: BytesMut::new(),
            discarding_too_long_frame: false,
            too_long_frame_length: 0,
        }
    }

    pub fn with_strip_delimiter(mut self, strip_delimiter: bool) -> Self {
        self.strip_delimiter = strip_delimiter;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    fn index_of(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn too_long(&self, length: usize) -> AppError {
        AppError::FrameTooLong {
            length: length as u64,
            max: self.max_frame_length as u64,
        }
    }
}

impl FrameDecoder for DelimiterFrameDecoder {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    fn decode_frame(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            let earliest = self
                .delimiters
                .iter()
                .filter_map(|delim| Self::index_of(&self.buffer, delim).map(|i| (i, delim.len())))
                .min_by_key(|(i, _)| *i);

            let Some((frame_length, delim_length)) = earliest else {
                if !self.discarding_too_long_frame {
                    if self.buffer.len() > self.max_frame_length {
                        self.too_long_frame_length = self.buffer.len();
                        self.buffer.clear();
                        self.discarding_too_long_frame = true;
                        if self.fail_fast {
                            return Err(self.too_long(self.too_long_frame_length));
                        }
                    }
                } else {
                    self.too_long_frame_length += self.buffer.len();
                    self.buffer.clear();
                }
                return Ok(None);
            };

            if self.discarding_too_long_frame {
                // the tail of the oversized frame
                self.discarding_too_long_frame = false;
                self.buffer.advance(frame_length + delim_length);
                let too_long_frame_length =
                    std::mem::take(&mut self.too_long_frame_length) + frame_length;
                if !self.fail_fast {
                    return Err(self.too_long(too_long_frame_length));
                }
                continue;
            }

            if frame_length > self.max_frame_length {
                self.buffer.advance(frame_length + delim_length);
                return Err(self.too_long(frame_length));
            }

            let frame = if self.strip_delimiter {
                let frame = self.buffer.split_to(frame_length).freeze();
                self.buffer.advance(delim_length);
                frame
            } else {
                self.buffer.split_to(frame_length + delim_length).freeze()
            };
            return Ok(Some(frame));
        }
    }
}
