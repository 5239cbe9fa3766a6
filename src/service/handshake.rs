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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::network::{ConnContext, Connection};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Loads a PEM certificate chain and private key into a server TLS config.
pub fn load_tls_config(cert_file: &str, key_file: &str) -> AppResult<Arc<rustls::ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|err| AppError::InvalidValue(format!("certificate {}: {}", cert_file, err)))?;
    if certs.is_empty() {
        return Err(AppError::InvalidValue(format!(
            "certificate {}: no certificate found",
            cert_file
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key_file)
        .map_err(|err| AppError::InvalidValue(format!("private key {}: {}", key_file, err)))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// A client TLS config trusting only `roots`.
pub fn client_tls_config(roots: RootCertStore) -> AppResult<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn tls_error(err: rustls::Error) -> AppError {
    AppError::IllegalStateError(format!("tls config: {}", err))
}

/// Turns an accepted socket into a connection: an optional TLS handshake,
/// then, if enabled, a websocket upgrade for peers that open with an HTTP
/// `GET`. Other peers keep talking raw frames on the same port.
#[derive(Clone)]
pub(crate) struct Handshake {
    tls: Option<TlsAcceptor>,
    websocket: bool,
    timeout: Duration,
}

impl Handshake {
    pub(crate) fn from_config(network: &NetworkConfig) -> AppResult<Self> {
        let tls = match network.tls_files() {
            Some((cert_file, key_file)) => {
                let config = load_tls_config(cert_file, key_file)?;
                info!(cert = cert_file, "tls enabled");
                Some(TlsAcceptor::from(config))
            }
            None => None,
        };
        if network.websocket {
            info!("websocket upgrades enabled");
        }
        Ok(Handshake {
            tls,
            websocket: network.websocket,
            timeout: network.handshake_timeout(),
        })
    }

    pub(crate) async fn open(
        &self,
        conn_id: u64,
        socket: TcpStream,
        ctx: &ConnContext,
    ) -> AppResult<Arc<Connection>> {
        if self.tls.is_none() && !self.websocket {
            return Ok(Connection::from_tcp(conn_id, socket, ctx));
        }
        if let Err(err) = socket.set_nodelay(true) {
            debug!(conn_id, "set nodelay failed: {}", err);
        }
        let local_addr = socket.local_addr().ok();
        let remote_addr = socket.peer_addr().ok();
        time::timeout(self.timeout, async {
            match &self.tls {
                Some(acceptor) => {
                    let stream = acceptor.accept(socket).await?;
                    self.detect(conn_id, stream, local_addr, remote_addr, ctx).await
                }
                None => self.detect(conn_id, socket, local_addr, remote_addr, ctx).await,
            }
        })
        .await
        .map_err(|_| {
            AppError::DetailedIoError(format!(
                "handshake of connection {} timed out after {:?}",
                conn_id, self.timeout
            ))
        })?
    }

    async fn detect<S>(
        &self,
        conn_id: u64,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        ctx: &ConnContext,
    ) -> AppResult<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.websocket {
            return Ok(Connection::from_stream(
                conn_id,
                stream,
                local_addr,
                remote_addr,
                ctx,
            ));
        }

        // the peeked bytes stay in the buffer for whoever reads next
        let mut stream = BufReader::new(stream);
        let first = stream.fill_buf().await?.first().copied();
        if first != Some(b'G') {
            return Ok(Connection::from_stream(
                conn_id,
                stream,
                local_addr,
                remote_addr,
                ctx,
            ));
        }
        let websocket = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|err| AppError::MalformedProtocol(format!("websocket upgrade: {}", err)))?;
        debug!(conn_id, remote = ?remote_addr, "websocket upgraded");
        Ok(Connection::from_websocket(
            conn_id,
            websocket,
            local_addr,
            remote_addr,
            ctx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".pem").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_generated_pair() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = write_temp(&generated.cert.pem());
        let key = write_temp(&generated.key_pair.serialize_pem());

        let config = load_tls_config(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn missing_or_empty_files_are_rejected() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = write_temp(&generated.key_pair.serialize_pem());
        let key_path = key.path().to_str().unwrap();

        let missing = load_tls_config("/nonexistent/server.pem", key_path);
        assert!(matches!(missing, Err(AppError::InvalidValue(_))));

        let empty = write_temp("");
        let empty = load_tls_config(empty.path().to_str().unwrap(), key_path);
        assert!(matches!(empty, Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn plain_config_has_no_tls() {
        let handshake = Handshake::from_config(&NetworkConfig::default()).unwrap();
        assert!(handshake.tls.is_none());
        assert!(!handshake.websocket);

        let network = NetworkConfig {
            cert_file: Some("/nonexistent/server.pem".into()),
            private_key_file: Some("/nonexistent/server.key".into()),
            ..NetworkConfig::default()
        };
        assert!(Handshake::from_config(&network).is_err());
    }
}
