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

//! The decode pipeline between a raw frame and the dispatcher.
//!
//! Each [`Interceptor`] receives a [`Request`] and either passes it on with
//! [`Chain::proceed`] or returns without doing so, which drops the request.
//! Protocol decoders are interceptors that rewrite the message id to the
//! protocol's command code and store the decoded value on the request, so the
//! router never has to know the protocol.

use std::sync::Arc;

use tracing::trace;

use crate::network::LengthField;
use crate::router::Request;

pub use frame::LengthFieldFrameInterceptor;
pub use htlv_crc::{crc16_modbus, HtlvCrcDecoder, HtlvCrcMessage};
pub use ltv::{LtvLittleDecoder, LtvMessage};
pub use tlv::{TlvDecoder, TlvMessage};

mod frame;
mod htlv_crc;
mod ltv;
mod tlv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// the request reached the end of the chain
    Delivered,
    /// a stage stopped the request, e.g. a checksum mismatch or a partial frame
    Halted,
}

pub trait Interceptor: Send + Sync {
    fn intercept(&self, request: Request, chain: &mut Chain<'_>) -> Outcome;
}

/// An interceptor that also defines how the byte stream is framed.
pub trait Decoder: Interceptor {
    fn length_field(&self) -> Option<LengthField>;

    /// Caps frames to a body of at most `max_body` bytes, `0` meaning no
    /// limit beyond the length field itself. Decoders whose frame size is
    /// fixed by the protocol keep their own limit.
    fn limit_body_length(&mut self, _max_body: u32) {}
}

/// The frame length for a `header` plus a body capped at `max_body`.
pub(crate) fn max_frame_length(header: usize, max_body: u32) -> u64 {
    let body = match max_body {
        0 => u32::MAX,
        max => max,
    };
    body as u64 + header as u64
}

/// Cursor over the stages after the current one.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    delivered: &'a mut Vec<Request>,
}

impl Chain<'_> {
    /// Hands `request` to the next stage. May be called more than once, e.g.
    /// by a stage that splits one input into several frames.
    pub fn proceed(&mut self, request: Request) -> Outcome {
        match self.interceptors.split_first() {
            Some((next, rest)) => {
                let mut chain = Chain {
                    interceptors: rest,
                    delivered: &mut *self.delivered,
                };
                next.intercept(request, &mut chain)
            }
            None => {
                self.delivered.push(request);
                Outcome::Delivered
            }
        }
    }
}

/// Assembles a chain: the head stage, the body stages in registration order,
/// then the tail stage.
#[derive(Clone, Default)]
pub struct ChainBuilder {
    head: Option<Arc<dyn Interceptor>>,
    body: Vec<Arc<dyn Interceptor>>,
    tail: Option<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.head = Some(interceptor);
        self
    }

    pub fn tail(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.tail = Some(interceptor);
        self
    }

    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.body.push(interceptor);
        self
    }

    /// Puts `interceptor` ahead of the body stages registered so far.
    pub fn prepend_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.body.insert(0, interceptor);
        self
    }

    pub fn build(&self) -> InterceptorChain {
        let interceptors: Vec<Arc<dyn Interceptor>> = self
            .head
            .iter()
            .chain(self.body.iter())
            .chain(self.tail.iter())
            .cloned()
            .collect();
        InterceptorChain {
            interceptors: Arc::from(interceptors),
        }
    }
}

/// A built, immutable chain shared by every connection.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    /// Runs `request` through every stage and returns the requests that came
    /// out of the end, in order.
    pub fn execute(&self, request: Request) -> Vec<Request> {
        let mut delivered = Vec::new();
        let conn_id = request.conn_id();
        let outcome = Chain {
            interceptors: &self.interceptors,
            delivered: &mut delivered,
        }
        .proceed(request);
        trace!(conn_id, ?outcome, delivered = delivered.len(), "interceptor chain finished");
        delivered
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        ChainBuilder::new().build()
    }
}
