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

use bytes::{Buf, Bytes};
use tracing::warn;

use crate::interceptor::{max_frame_length, Chain, Decoder, Interceptor, Outcome};
use crate::network::{ByteOrder, LengthField};
use crate::router::Request;

/// A decoded tag-length-value frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvMessage {
    pub tag: u32,
    pub length: u32,
    pub value: Bytes,
}

/// `tag(4) | length(4) | value`, routed by tag.
#[derive(Debug, Clone)]
pub struct TlvDecoder {
    byte_order: ByteOrder,
    max_frame_length: u64,
}

impl TlvDecoder {
    pub const HEADER_SIZE: usize = 8;

    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            max_frame_length: max_frame_length(Self::HEADER_SIZE, 0),
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: u64) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

impl Default for TlvDecoder {
    fn default() -> Self {
        Self::new(ByteOrder::BigEndian)
    }
}

impl Interceptor for TlvDecoder {
    fn intercept(&self, mut request: Request, chain: &mut Chain<'_>) -> Outcome {
        let data = request.data().clone();
        if data.len() < Self::HEADER_SIZE {
            return chain.proceed(request);
        }

        let mut head = &data[..Self::HEADER_SIZE];
        let (tag, length) = match self.byte_order {
            ByteOrder::BigEndian => (head.get_u32(), head.get_u32()),
            ByteOrder::LittleEndian => (head.get_u32_le(), head.get_u32_le()),
        };
        let end = Self::HEADER_SIZE + length as usize;
        if data.len() < end {
            warn!(
                conn_id = request.conn_id(),
                tag, length, "tlv value is shorter than its length field"
            );
            return Outcome::Halted;
        }

        let value = data.slice(Self::HEADER_SIZE..end);
        let message = request.message_mut();
        message.id = tag;
        message.set_data(value.clone());
        request.set_decoded(TlvMessage { tag, length, value });
        chain.proceed(request)
    }
}

impl Decoder for TlvDecoder {
    fn length_field(&self) -> Option<LengthField> {
        Some(LengthField::new(
            self.byte_order,
            self.max_frame_length,
            4,
            4,
            0,
            0,
        ))
    }

    fn limit_body_length(&mut self, max_body: u32) {
        self.max_frame_length = max_frame_length(Self::HEADER_SIZE, max_body);
    }
}
