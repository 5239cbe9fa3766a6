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
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::interceptor::{ChainBuilder, Decoder, Interceptor, TlvDecoder};
use crate::network::{
    ConnContext, ConnHook, ConnManager, Connection, DataPack, FrameDecoder, FrameDecoderFactory,
    HeartbeatOption, HeartbeatSettings, LengthField, LengthFieldFrameDecoder, TlvPack,
};
use crate::router::{GroupRouter, MsgHandler, Router, RouterHandler, RouterTable};
use crate::service::ServerConfig;

/// Finishes a custom decoder once the configured body limit is known.
type DecoderBuild = Box<dyn FnOnce(u32) -> (Arc<dyn Interceptor>, Option<LengthField>) + Send>;

enum DecoderSetting {
    /// TLV with the configured byte order
    Default,
    Disabled,
    Custom(DecoderBuild),
}

/// Everything a server or client registers before it starts: routes,
/// interceptors, framing, hooks and the heartbeat. Turned into a shared
/// [`ConnContext`] once the endpoint runs.
pub struct ConnSetup {
    routes: RouterTable,
    chain: ChainBuilder,
    decoder: DecoderSetting,
    frame_decoder: Option<FrameDecoderFactory>,
    datapack: Option<Arc<dyn DataPack>>,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,
    heartbeat: Option<(Duration, HeartbeatOption)>,
}

impl Default for ConnSetup {
    fn default() -> Self {
        Self {
            routes: RouterTable::new(),
            chain: ChainBuilder::new(),
            decoder: DecoderSetting::Default,
            frame_decoder: None,
            datapack: None,
            on_conn_start: None,
            on_conn_stop: None,
            heartbeat: None,
        }
    }
}

impl ConnSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a three-phase router.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn add_router(&mut self, msg_id: u32, router: Arc<dyn Router>) -> &mut Self {
        self.routes.add_router(msg_id, router);
        self
    }

    /// Middleware run ahead of every handler chain registered after this call.
    pub fn use_handlers(
        &mut self,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> &mut Self {
        self.routes.use_handlers(handlers);
        self
    }

    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn add_handler(
        &mut self,
        msg_id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> &mut Self {
        self.routes.add_handler(msg_id, handlers);
        self
    }

    pub fn group(
        &mut self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter<'_> {
        self.routes.group(start, end, handlers)
    }

    /// Appends a stage after the decoder.
    pub fn add_interceptor<I: Interceptor + 'static>(&mut self, interceptor: I) -> &mut Self {
        self.chain.add_interceptor(Arc::new(interceptor));
        self
    }

    /// Replaces the default TLV decoder. Its length field, if any, also frames
    /// the byte stream, limited by the configured `max_packet_size`.
    pub fn set_decoder<D: Decoder + 'static>(&mut self, decoder: D) -> &mut Self {
        self.decoder = DecoderSetting::Custom(Box::new(move |max_body| {
            let mut decoder = decoder;
            decoder.limit_body_length(max_body);
            let length_field = decoder.length_field();
            (Arc::new(decoder) as Arc<dyn Interceptor>, length_field)
        }));
        self
    }

    /// No decoder stage and no framing unless a frame decoder is set.
    pub fn disable_decoder(&mut self) -> &mut Self {
        self.decoder = DecoderSetting::Disabled;
        self
    }

    /// Frames the byte stream with `factory`'s decoders instead of the
    /// decoder's length field. One decoder is created per connection.
    pub fn set_frame_decoder<F, D>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: FrameDecoder + 'static,
    {
        self.frame_decoder = Some(Arc::new(move || Box::new(factory()) as Box<dyn FrameDecoder>));
        self
    }

    /// Packs outgoing messages; defaults to TLV.
    pub fn set_datapack(&mut self, datapack: Arc<dyn DataPack>) -> &mut Self {
        self.datapack = Some(datapack);
        self
    }

    pub fn set_on_conn_start<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_conn_start = Some(Arc::new(hook));
        self
    }

    pub fn set_on_conn_stop<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_conn_stop = Some(Arc::new(hook));
        self
    }

    pub fn start_heartbeat(&mut self, interval: Duration) -> &mut Self {
        self.start_heartbeat_with_option(interval, HeartbeatOption::default())
    }

    pub fn start_heartbeat_with_option(
        &mut self,
        interval: Duration,
        option: HeartbeatOption,
    ) -> &mut Self {
        self.heartbeat = Some((interval, option));
        self
    }

    /// Builds the shared context and spawns the worker pool.
    ///
    /// # Panics
    ///
    /// Panics if routes conflict or the decoder's length field is invalid.
    pub fn build(
        self,
        config: Arc<ServerConfig>,
        conn_manager: Arc<ConnManager>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> ConnContext {
        let ConnSetup {
            mut routes,
            mut chain,
            decoder,
            frame_decoder,
            datapack,
            on_conn_start,
            on_conn_stop,
            heartbeat,
        } = self;
        let network = &config.network;

        let length_field = match decoder {
            DecoderSetting::Default => {
                let mut decoder = TlvDecoder::new(network.byte_order());
                decoder.limit_body_length(network.max_packet_size);
                let length_field = decoder.length_field();
                chain.prepend_interceptor(Arc::new(decoder));
                length_field
            }
            DecoderSetting::Disabled => None,
            DecoderSetting::Custom(build) => {
                let (interceptor, length_field) = build(network.max_packet_size);
                chain.prepend_interceptor(interceptor);
                length_field
            }
        };

        let frame_decoder = frame_decoder.or_else(|| {
            length_field.map(|length_field| {
                if let Err(err) = length_field.validate() {
                    panic!("invalid length field: {err}");
                }
                let factory: FrameDecoderFactory = Arc::new(move || {
                    Box::new(LengthFieldFrameDecoder::new(length_field)) as Box<dyn FrameDecoder>
                });
                factory
            })
        });

        let datapack = datapack.unwrap_or_else(|| {
            Arc::new(TlvPack::new(network.byte_order(), network.max_packet_size))
        });

        let heartbeat = heartbeat
            .or_else(|| {
                config
                    .heartbeat
                    .enabled
                    .then(|| (config.heartbeat.interval(), HeartbeatOption::default()))
            })
            .map(|(interval, option)| {
                let msg_id = option.msg_id();
                if routes.resolve(msg_id).is_none() {
                    routes.add_router(msg_id, option.router());
                }
                debug!(msg_id, ?interval, "heartbeat enabled");
                HeartbeatSettings {
                    interval,
                    max_idle: config.heartbeat.max_idle(),
                    option,
                }
            });

        let msg_handler = MsgHandler::new(
            routes,
            config.worker_pool.to_pool_config(),
            notify_shutdown,
            shutdown_complete_tx,
        );

        ConnContext {
            config,
            datapack,
            frame_decoder,
            interceptors: chain.build(),
            msg_handler: Arc::new(msg_handler),
            conn_manager,
            on_conn_start,
            on_conn_stop,
            heartbeat,
        }
    }
}
