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

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::FutureExt;
use stonenet::router::{handler, recovery};
use stonenet::service::setup_tracing;
use stonenet::{AppResult, ConnSetup, Server, ServerConfig};
use tokio::runtime;
use tracing::{info, warn};

const ECHO_MSG_ID: u32 = 1;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _tracing_guard = setup_tracing(&commandline.log_dir)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let mut setup = ConnSetup::new();
    setup.use_handlers([recovery()]);
    setup.add_handler(
        ECHO_MSG_ID,
        [handler(|request| {
            async move {
                let data = request.data().clone();
                if let Err(err) = request.connection().send(ECHO_MSG_ID, data).await {
                    warn!(conn_id = request.conn_id(), "echo failed: {}", err);
                }
            }
            .boxed()
        })],
    );
    setup
        .set_on_conn_start(|conn| {
            info!(conn_id = conn.conn_id(), remote = ?conn.remote_addr(), "client online")
        })
        .set_on_conn_stop(|conn| info!(conn_id = conn.conn_id(), "client offline"));

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;
    rt.block_on(Server::new(config, setup).serve())
}
