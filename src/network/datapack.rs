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

//! Wire headers written in front of outbound payloads.

use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::{ByteOrder, LengthField, Message};
use crate::{AppError, AppResult};

pub trait DataPack: Send + Sync + Debug {
    fn head_len(&self) -> usize;

    fn pack(&self, msg: &Message) -> Bytes;

    /// Reads the header only; the returned message has an empty payload.
    fn unpack(&self, head: &[u8]) -> AppResult<Message>;

    /// Unpacks a complete frame, header and payload.
    fn unpack_frame(&self, frame: Bytes) -> AppResult<Message> {
        let head_len = self.head_len();
        let mut msg = self.unpack(&frame)?;
        let end = head_len + msg.data_len as usize;
        if frame.len() < end {
            return Err(AppError::MalformedProtocol(format!(
                "frame holds {} bytes, header announces {}",
                frame.len(),
                end
            )));
        }
        msg.data = frame.slice(head_len..end);
        msg.raw_data = frame;
        Ok(msg)
    }
}

/// `id | len | payload`, both header fields 4 bytes wide.
#[derive(Debug, Clone)]
pub struct TlvPack {
    byte_order: ByteOrder,
    /// zero disables the check
    max_packet_size: u32,
}

impl TlvPack {
    pub const HEAD_LEN: usize = 8;

    pub fn new(byte_order: ByteOrder, max_packet_size: u32) -> Self {
        Self {
            byte_order,
            max_packet_size,
        }
    }

    /// The length field a frame decoder needs to split a stream of these
    /// packets.
    pub fn length_field(&self) -> LengthField {
        LengthField::new(
            self.byte_order,
            max_frame_length(self.max_packet_size, Self::HEAD_LEN),
            4,
            4,
            0,
            0,
        )
    }
}

impl DataPack for TlvPack {
    fn head_len(&self) -> usize {
        Self::HEAD_LEN
    }

    fn pack(&self, msg: &Message) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEAD_LEN + msg.data.len());
        match self.byte_order {
            ByteOrder::BigEndian => {
                buf.put_u32(msg.id);
                buf.put_u32(msg.data.len() as u32);
            }
            ByteOrder::LittleEndian => {
                buf.put_u32_le(msg.id);
                buf.put_u32_le(msg.data.len() as u32);
            }
        }
        buf.put_slice(&msg.data);
        buf.freeze()
    }

    fn unpack(&self, mut head: &[u8]) -> AppResult<Message> {
        if head.len() < Self::HEAD_LEN {
            return Err(AppError::MalformedProtocol(format!(
                "tlv header needs {} bytes, got {}",
                Self::HEAD_LEN,
                head.len()
            )));
        }
        let (id, data_len) = match self.byte_order {
            ByteOrder::BigEndian => (head.get_u32(), head.get_u32()),
            ByteOrder::LittleEndian => (head.get_u32_le(), head.get_u32_le()),
        };
        check_packet_size(data_len, self.max_packet_size)?;
        Ok(Message {
            id,
            data_len,
            ..Default::default()
        })
    }
}

/// Legacy header: `len | id | payload`, little-endian.
#[derive(Debug, Clone)]
pub struct LtvPack {
    max_packet_size: u32,
}

impl LtvPack {
    pub const HEAD_LEN: usize = 8;

    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }

    pub fn length_field(&self) -> LengthField {
        LengthField::new(
            ByteOrder::LittleEndian,
            max_frame_length(self.max_packet_size, Self::HEAD_LEN),
            0,
            4,
            4,
            0,
        )
    }
}

impl DataPack for LtvPack {
    fn head_len(&self) -> usize {
        Self::HEAD_LEN
    }

    fn pack(&self, msg: &Message) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEAD_LEN + msg.data.len());
        buf.put_u32_le(msg.data.len() as u32);
        buf.put_u32_le(msg.id);
        buf.put_slice(&msg.data);
        buf.freeze()
    }

    fn unpack(&self, mut head: &[u8]) -> AppResult<Message> {
        if head.len() < Self::HEAD_LEN {
            return Err(AppError::MalformedProtocol(format!(
                "ltv header needs {} bytes, got {}",
                Self::HEAD_LEN,
                head.len()
            )));
        }
        let data_len = head.get_u32_le();
        let id = head.get_u32_le();
        check_packet_size(data_len, self.max_packet_size)?;
        Ok(Message {
            id,
            data_len,
            ..Default::default()
        })
    }
}

fn check_packet_size(data_len: u32, max_packet_size: u32) -> AppResult<()> {
    if max_packet_size > 0 && data_len > max_packet_size {
        return Err(AppError::FrameTooLong {
            length: data_len as u64,
            max: max_packet_size as u64,
        });
    }
    Ok(())
}

fn max_frame_length(max_packet_size: u32, head_len: usize) -> u64 {
    if max_packet_size == 0 {
        u32::MAX as u64 + head_len as u64
    } else {
        max_packet_size as u64 + head_len as u64
    }
}
