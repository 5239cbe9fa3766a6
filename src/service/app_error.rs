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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors
    #[error("frame length {length} exceeds {max}")]
    FrameTooLong { length: u64, max: u64 },

    #[error("negative length field: {0}")]
    NegativeLength(i64),

    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    /// connection errors
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("send buffer of connection {0} is full, send timed out")]
    SendBufferTimeout(u64),

    #[error("queue of worker {0} is full")]
    WorkerQueueFull(usize),

    #[error("max connections reached: {0}")]
    MaxConnectionsReached(usize),
}

impl AppError {
    /// Framing and protocol errors only affect the offending frame; the
    /// connection stays usable.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            AppError::FrameTooLong { .. }
                | AppError::NegativeLength(_)
                | AppError::CorruptedFrame(_)
                | AppError::MalformedProtocol(_)
        )
    }
}
