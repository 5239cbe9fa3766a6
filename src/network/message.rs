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

use bytes::Bytes;

/// One routable unit: a message id and its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub data_len: u32,
    pub data: Bytes,
    /// the frame as it came off the wire, kept for logging and checksums
    pub raw_data: Bytes,
}

impl Message {
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id,
            data_len: data.len() as u32,
            raw_data: data.clone(),
            data,
        }
    }

    /// A message for a freshly decoded frame, before any protocol stage has
    /// assigned it an id.
    pub fn from_frame(frame: Bytes) -> Self {
        Self::new(0, frame)
    }

    pub fn set_data(&mut self, data: Bytes) {
        self.data_len = data.len() as u32;
        self.data = data;
    }
}
