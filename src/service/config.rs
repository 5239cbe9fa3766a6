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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::ByteOrder;
use crate::utils::{OverflowPolicy, WorkerPoolConfig};
use crate::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "stonenet".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// upper bound of a message body, 0 means unlimited
    pub max_packet_size: u32,
    pub io_read_buffer_size: usize,
    /// capacity of each connection's outbound queue
    pub max_msg_chan_len: usize,
    pub send_buffer_timeout_ms: u64,
    /// how long a stopping connection may spend flushing and closing its socket
    pub flush_timeout_ms: u64,
    pub little_endian: bool,
    /// accept websocket upgrades on the same port as raw connections
    pub websocket: bool,
    /// TLS is enabled when both files are set
    pub cert_file: Option<String>,
    pub private_key_file: Option<String>,
    /// upper bound of the TLS and websocket handshakes
    pub handshake_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 8999,
            max_connection: 12000,
            max_packet_size: 4096,
            io_read_buffer_size: 1024,
            max_msg_chan_len: 1024,
            send_buffer_timeout_ms: 5,
            flush_timeout_ms: 1000,
            little_endian: false,
            websocket: false,
            cert_file: None,
            private_key_file: None,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn send_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.send_buffer_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// `(cert_file, private_key_file)` when TLS is enabled.
    pub fn tls_files(&self) -> Option<(&str, &str)> {
        match (self.cert_file.as_deref(), self.private_key_file.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        if self.little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerPoolSection {
    /// 0 runs every request on its own task
    pub size: usize,
    pub max_task_len: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for WorkerPoolSection {
    fn default() -> Self {
        Self {
            size: 10,
            max_task_len: 1024,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

impl WorkerPoolSection {
    pub fn to_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: self.size,
            channel_capacity: self.max_task_len.max(1),
            overflow_policy: self.overflow_policy,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatSection {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_idle_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 10_000,
            max_idle_ms: 10_000,
        }
    }
}

impl HeartbeatSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub worker_pool: WorkerPoolSection,
    pub heartbeat: HeartbeatSection,
}

impl ServerConfig {
    /// Loads the config file at `path`; missing keys keep their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        Ok(server_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.network.bind_addr(), "0.0.0.0:8999");
        assert_eq!(config.network.max_connection, 12000);
        assert_eq!(config.network.max_packet_size, 4096);
        assert_eq!(config.network.send_buffer_timeout(), Duration::from_millis(5));
        assert_eq!(config.network.byte_order(), ByteOrder::BigEndian);
        assert_eq!(config.network.flush_timeout(), Duration::from_secs(1));
        assert!(!config.network.websocket);
        assert!(config.network.tls_files().is_none());
        assert_eq!(config.worker_pool.size, 10);
        assert_eq!(config.worker_pool.max_task_len, 1024);
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(10));
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[general]
name = "demo"

[network]
port = 7777
little_endian = true
websocket = true
cert_file = "certs/server.pem"
private_key_file = "certs/server.key"

[worker_pool]
size = 4
overflow_policy = "drop"

[heartbeat]
enabled = true
interval_ms = 500
"#
        )
        .unwrap();

        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.general.name, "demo");
        assert_eq!(config.network.port, 7777);
        assert_eq!(config.network.ip, "0.0.0.0");
        assert_eq!(config.network.byte_order(), ByteOrder::LittleEndian);
        assert!(config.network.websocket);
        assert_eq!(
            config.network.tls_files(),
            Some(("certs/server.pem", "certs/server.key"))
        );
        assert_eq!(config.network.handshake_timeout(), Duration::from_secs(10));
        let pool = config.worker_pool.to_pool_config();
        assert_eq!(pool.num_workers, 4);
        assert_eq!(pool.channel_capacity, 1024);
        assert_eq!(pool.overflow_policy, OverflowPolicy::Drop);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval(), Duration::from_millis(500));
        assert_eq!(config.heartbeat.max_idle(), Duration::from_secs(10));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ServerConfig::set_up_config("/nonexistent/stonenet.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
