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

//! A lightweight TCP server framework.
//!
//! Bytes read from a [`network::Connection`] are framed by a
//! [`network::FrameDecoder`], passed through an [`interceptor::InterceptorChain`]
//! that decodes the protocol, and dispatched by message id to a
//! [`router::Router`] or a middleware chain on a sharded worker pool. A
//! [`service::Server`] or [`service::Client`] wires these together from a
//! [`service::ConnSetup`].

pub mod interceptor;
pub mod network;
pub mod router;
pub mod service;
pub mod utils;

#[cfg(test)]
mod testing;

pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ConnSetup, Server,
    ServerConfig, Shutdown,
};
