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

//! Message routing and dispatch.
//!
//! A message id resolves to either a fixed three-phase [`Router`] or a list of
//! [`RouterHandler`]s composed from shared middleware. [`MsgHandler`] runs the
//! resolved chain on the worker that owns the request's connection, which
//! keeps one connection's requests in arrival order.

pub use base::Router;
pub use msg_handler::{FuncTask, MsgHandler, Task};
pub use recovery::recovery;
pub use request::{handler, Request, RouterHandler, RouterStep};
pub use route_table::{Route, RouterTable};
pub use router_slices::{GroupRouter, RouterSlices};

mod base;
mod msg_handler;
mod recovery;
mod request;
mod route_table;
mod router_slices;
