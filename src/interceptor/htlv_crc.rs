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
use tracing::warn;

use crate::interceptor::{Chain, Decoder, Interceptor, Outcome};
use crate::network::{ByteOrder, LengthField};
use crate::router::Request;

/// `head(1) | funcode(1) | length(1) | body | crc(2)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlvCrcMessage {
    pub head: u8,
    pub funcode: u8,
    pub length: u8,
    pub body: Bytes,
    pub crc: [u8; 2],
}

/// Header, function code, length, value and a CRC-16/MODBUS checksum (low byte
/// first) over everything before it. Routed by function code; frames with a
/// bad checksum are dropped.
#[derive(Debug, Clone, Default)]
pub struct HtlvCrcDecoder;

impl HtlvCrcDecoder {
    pub const HEADER_SIZE: usize = 5;
}

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

impl Interceptor for HtlvCrcDecoder {
    fn intercept(&self, mut request: Request, chain: &mut Chain<'_>) -> Outcome {
        let data = request.data().clone();
        let size = data.len();
        if size < Self::HEADER_SIZE {
            return chain.proceed(request);
        }

        let crc = [data[size - 2], data[size - 1]];
        let expected = crc16_modbus(&data[..size - 2]).to_le_bytes();
        if crc != expected {
            warn!(
                conn_id = request.conn_id(),
                "crc check error {:02x?}, expected {:02x?}, frame {:02x?}",
                crc,
                expected,
                &data[..]
            );
            return Outcome::Halted;
        }

        let decoded = HtlvCrcMessage {
            head: data[0],
            funcode: data[1],
            length: data[2],
            body: data.slice(3..size - 2),
            crc,
        };
        let message = request.message_mut();
        message.id = decoded.funcode as u32;
        message.set_data(decoded.body.clone());
        request.set_decoded(decoded);
        chain.proceed(request)
    }
}

impl Decoder for HtlvCrcDecoder {
    fn length_field(&self) -> Option<LengthField> {
        // the two crc bytes are not counted by the length byte
        Some(LengthField::new(
            ByteOrder::BigEndian,
            u8::MAX as u64 + Self::HEADER_SIZE as u64,
            2,
            1,
            2,
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::interceptor::ChainBuilder;
    use crate::network::Message;
    use crate::router::handler;
    use crate::service::{ConnSetup, ServerConfig};
    use crate::testing::{context, duplex_connection, spawn_start, wait_until};

    const FRAME_10: &str = "a21018686574000004d30000000000000000000000000000000000e7a2";
    const FRAME_13: &str = "a2130e686574000004d30000000100000040c3";

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn decode(frame: Vec<u8>) -> Vec<Request> {
        let env = context(ConnSetup::new(), ServerConfig::default());
        let (conn, _peer) = duplex_connection(1, &env.ctx);
        let mut builder = ChainBuilder::new();
        builder.add_interceptor(Arc::new(HtlvCrcDecoder));
        builder
            .build()
            .execute(Request::new(conn, Message::from_frame(Bytes::from(frame))))
    }

    #[test]
    fn crc16_modbus_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[tokio::test]
    async fn valid_frame_routes_by_funcode() {
        let delivered = decode(hex(FRAME_10));
        assert_eq!(delivered.len(), 1);
        let request = &delivered[0];
        assert_eq!(request.msg_id(), 0x10);
        assert_eq!(request.data().len(), 0x18);
        let decoded = request.decoded::<HtlvCrcMessage>().unwrap();
        assert_eq!(decoded.head, 0xa2);
        assert_eq!(decoded.length, 0x18);
        assert_eq!(decoded.crc, [0xe7, 0xa2]);
    }

    #[tokio::test]
    async fn bad_checksum_is_dropped() {
        let mut frame = hex(FRAME_13);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(decode(frame).is_empty());
    }

    #[tokio::test]
    async fn one_and_a_half_packets_over_a_connection() {
        let funcodes: Arc<Mutex<Vec<(u32, usize)>>> = Arc::default();
        let mut setup = ConnSetup::new();
        setup.set_decoder(HtlvCrcDecoder);
        for funcode in [0x10, 0x13] {
            let funcodes = funcodes.clone();
            setup.add_handler(
                funcode,
                [handler(move |request| {
                    let funcodes = funcodes.clone();
                    async move {
                        let body = request.decoded::<HtlvCrcMessage>().map(|m| m.body.len());
                        funcodes.lock().push((request.msg_id(), body.unwrap_or_default()));
                    }
                    .boxed()
                })],
            );
        }
        let env = context(setup, ServerConfig::default());
        let (conn, mut peer) = duplex_connection(1, &env.ctx);
        let _handle = spawn_start(&conn).await;

        let mut stream = hex(FRAME_10);
        stream.extend(hex(FRAME_13));
        peer.write_all(&stream[..38]).await.unwrap();
        peer.flush().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || funcodes.lock().len() == 1).await);
        peer.write_all(&stream[38..]).await.unwrap();

        assert!(wait_until(Duration::from_secs(1), || funcodes.lock().len() == 2).await);
        assert_eq!(*funcodes.lock(), vec![(0x10, 24), (0x13, 14)]);
        conn.stop();
    }
}
