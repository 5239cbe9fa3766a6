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

//! The two halves of a connection's socket.
//!
//! Byte streams (plain TCP, TLS) hand the reader arbitrary chunks that still
//! need framing. Message transports (WebSocket) hand it one complete message
//! per read, which skips the frame decoder.

use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

pub(crate) enum Inbound {
    Stream(BoxedReader),
    Messages(BoxStream<'static, io::Result<Bytes>>),
}

pub(crate) enum Received {
    /// `n` more bytes were appended to the read buffer
    Chunk(usize),
    /// one whole message
    Message(Bytes),
    Eof,
}

impl Inbound {
    pub(crate) async fn read(&mut self, buffer: &mut BytesMut) -> io::Result<Received> {
        match self {
            Inbound::Stream(reader) => match reader.read_buf(buffer).await? {
                0 => Ok(Received::Eof),
                n => Ok(Received::Chunk(n)),
            },
            Inbound::Messages(messages) => match messages.next().await {
                Some(message) => message.map(Received::Message),
                None => Ok(Received::Eof),
            },
        }
    }
}

pub(crate) enum Outbound {
    Stream(BoxedWriter),
    Messages(BoxedSink),
}

impl Outbound {
    /// Writes one packed message and flushes it.
    pub(crate) async fn write_packet(&mut self, packet: Bytes) -> io::Result<()> {
        match self {
            Outbound::Stream(writer) => {
                writer.write_all(&packet).await?;
                writer.flush().await
            }
            Outbound::Messages(sink) => sink.send(packet).await,
        }
    }

    pub(crate) async fn close(&mut self) -> io::Result<()> {
        match self {
            Outbound::Stream(writer) => writer.shutdown().await,
            Outbound::Messages(sink) => sink.close().await,
        }
    }
}

/// Binary and text messages are delivered as they are; control frames are
/// answered by the websocket layer and never reach the reader.
pub(crate) fn websocket<S>(stream: WebSocketStream<S>) -> (Inbound, Outbound)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = stream.split();
    let messages = stream
        .filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(WsMessage::Text(text)) => Some(Ok(Bytes::from(text.into_bytes()))),
                Ok(_) => None,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => None,
                Err(err) => Some(Err(io::Error::other(err))),
            })
        })
        .boxed();
    let sink = sink
        .with(|packet: Bytes| future::ok::<_, WsError>(WsMessage::Binary(packet.to_vec())))
        .sink_map_err(io::Error::other);
    (Inbound::Messages(messages), Outbound::Messages(Box::pin(sink)))
}
