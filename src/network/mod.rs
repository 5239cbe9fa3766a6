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

pub use callbacks::CloseCallbacks;
pub use conn_manager::ConnManager;
pub use connection::{ConnContext, ConnHook, ConnState, Connection, FrameDecoderFactory};
pub use datapack::{DataPack, LtvPack, TlvPack};
pub use frame_decoder::{
    ByteOrder, DelimiterFrameDecoder, FrameDecoder, LengthField, LengthFieldFrameDecoder,
    LineFrameDecoder,
};
pub use heartbeat::{
    HeartbeatChecker, HeartbeatDefaultRouter, HeartbeatOption, HeartbeatSettings,
    MakeHeartbeatMsg, OnRemoteNotAlive, HEARTBEAT_DEFAULT_MSG_ID,
};
pub use message::Message;

mod callbacks;
mod conn_manager;
mod connection;
mod datapack;
mod frame_decoder;
mod heartbeat;
mod message;
mod transport;
