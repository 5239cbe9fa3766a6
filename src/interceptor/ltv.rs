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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LtvMessage {
    pub length: u32,
    pub tag: u32,
    pub value: Bytes,
}

/// `length(4) | tag(4) | value`, little-endian, routed by tag.
#[derive(Debug, Clone)]
pub struct LtvLittleDecoder {
    max_frame_length: u64,
}

impl LtvLittleDecoder {
    pub const HEADER_SIZE: usize = 8;

    pub fn new() -> Self {
        Self {
            max_frame_length: max_frame_length(Self::HEADER_SIZE, 0),
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: u64) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

impl Default for LtvLittleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for LtvLittleDecoder {
    fn intercept(&self, mut request: Request, chain: &mut Chain<'_>) -> Outcome {
        let data = request.data().clone();
        if data.len() < Self::HEADER_SIZE {
            return chain.proceed(request);
        }

        let mut head = &data[..Self::HEADER_SIZE];
        let length = head.get_u32_le();
        let tag = head.get_u32_le();
        let end = Self::HEADER_SIZE + length as usize;
        if data.len() < end {
            warn!(
                conn_id = request.conn_id(),
                tag, length, "ltv value is shorter than its length field"
            );
            return Outcome::Halted;
        }

        let value = data.slice(Self::HEADER_SIZE..end);
        let message = request.message_mut();
        message.id = tag;
        message.set_data(value.clone());
        request.set_decoded(LtvMessage { length, tag, value });
        chain.proceed(request)
    }
}

impl Decoder for LtvLittleDecoder {
    fn length_field(&self) -> Option<LengthField> {
        // the length counts the value only, so the tag is added back
        Some(LengthField::new(
            ByteOrder::LittleEndian,
            self.max_frame_length,
            0,
            4,
            4,
            0,
        ))
    }

    fn limit_body_length(&mut self, max_body: u32) {
        self.max_frame_length = max_frame_length(Self::HEADER_SIZE, max_body);
    }
}
