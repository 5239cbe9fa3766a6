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

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::interceptor::{Chain, Interceptor, Outcome};
use crate::network::{FrameDecoder, LengthField, LengthFieldFrameDecoder, Message};
use crate::router::Request;

const CLOSE_CALLBACK_HANDLER: &str = "length_field_frame_interceptor";

/// Splits an incoming message into length-field frames and passes each frame
/// down the chain as its own request.
///
/// Used where the transport delivers messages that may hold several frames or
/// part of one. Decoder state is kept per connection and dropped when the
/// connection closes.
pub struct LengthFieldFrameInterceptor {
    length_field: LengthField,
    decoders: Arc<DashMap<u64, LengthFieldFrameDecoder>>,
}

impl LengthFieldFrameInterceptor {
    /// # Panics
    ///
    /// Panics if `length_field` is invalid.
    pub fn new(length_field: LengthField) -> Self {
        if let Err(err) = length_field.validate() {
            panic!("invalid length field: {err}");
        }
        Self {
            length_field,
            decoders: Arc::new(DashMap::new()),
        }
    }

    /// Connections with buffered decoder state.
    pub fn tracked_connections(&self) -> usize {
        self.decoders.len()
    }
}

impl Interceptor for LengthFieldFrameInterceptor {
    fn intercept(&self, request: Request, chain: &mut Chain<'_>) -> Outcome {
        let conn = request.connection().clone();
        let conn_id = conn.conn_id();

        let frames = {
            let mut decoder = self.decoders.entry(conn_id).or_insert_with(|| {
                let decoders = self.decoders.clone();
                conn.add_close_callback(CLOSE_CALLBACK_HANDLER, &conn_id.to_string(), move || {
                    decoders.remove(&conn_id);
                });
                LengthFieldFrameDecoder::new(self.length_field)
            });
            decoder.decode(request.data())
        };
        if conn.is_closed() {
            self.decoders.remove(&conn_id);
        }

        let Some((last, rest)) = frames.split_last() else {
            trace!(conn_id, "waiting for more data");
            return Outcome::Halted;
        };
        for frame in rest {
            chain.proceed(request.fork(Message::from_frame(frame.clone())));
        }
        let mut request = request;
        request.set_message(Message::from_frame(last.clone()));
        chain.proceed(request)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::interceptor::ChainBuilder;
    use crate::network::ByteOrder;
    use crate::service::{ConnSetup, ServerConfig};
    use crate::testing::{context, duplex_connection, tlv};

    #[tokio::test]
    async fn reassembles_frames_per_connection() {
        let env = context(ConnSetup::new(), ServerConfig::default());
        let (first, _peer1) = duplex_connection(1, &env.ctx);
        let (second, _peer2) = duplex_connection(2, &env.ctx);

        let interceptor = Arc::new(LengthFieldFrameInterceptor::new(LengthField::new(
            ByteOrder::BigEndian,
            1024,
            4,
            4,
            0,
            0,
        )));
        let mut builder = ChainBuilder::new();
        builder.add_interceptor(interceptor.clone());
        let chain = builder.build();
        let send = |conn: &Arc<crate::network::Connection>, data: &[u8]| {
            chain.execute(Request::new(
                conn.clone(),
                Message::from_frame(Bytes::copy_from_slice(data)),
            ))
        };

        let mut stream = tlv(1, b"one");
        stream.extend(tlv(2, b"two"));
        let split = stream.len() - 4;

        let delivered = send(&first, &stream[..split]);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data().as_ref(), &tlv(1, b"one")[..]);

        // another connection's bytes do not mix in
        assert!(send(&second, &stream[split..]).is_empty());
        assert_eq!(interceptor.tracked_connections(), 2);

        let delivered = send(&first, &stream[split..]);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data().as_ref(), &tlv(2, b"two")[..]);

        first.stop();
        assert!(send(&first, b"").is_empty());
        assert_eq!(interceptor.tracked_connections(), 1);
    }

    #[test]
    #[should_panic(expected = "invalid length field")]
    fn rejects_invalid_length_field() {
        LengthFieldFrameInterceptor::new(LengthField::new(ByteOrder::BigEndian, 1024, 0, 5, 0, 0));
    }
}
