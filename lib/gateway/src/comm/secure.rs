// SPDX-License-Identifier: Apache-2.0

//! Mutual-TLS overlay for one channel.
//!
//! The TLS session does not own a socket; its byte sink and source is the
//! channel's [`ChannelStream`] adapter, so handshake records and ciphertext
//! travel inside ordinary outer frames. A fresh server configuration is
//! built on every connect from the certificates named by the provider, and
//! the peer must present a certificate that verifies against the configured
//! CA.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::clients::cert::{location_to_path, CertProvider};
use crate::comm::channel::{Channel, ChannelStream};
use crate::comm::CommChannel;
use crate::error::{Error, Result};

type SecureRead = ReadHalf<TlsStream<ChannelStream>>;
type SecureWrite = WriteHalf<TlsStream<ChannelStream>>;

pub struct SecureChannel {
    channel: Channel,
    provider: Arc<dyn CertProvider>,
    cert_storage: String,
    ca_cert: PathBuf,
    read_half: AsyncMutex<Option<SecureRead>>,
    write_half: AsyncMutex<Option<SecureWrite>>,
}

impl SecureChannel {
    pub(crate) fn new(
        channel: Channel,
        provider: Arc<dyn CertProvider>,
        cert_storage: &str,
        ca_cert: &Path,
    ) -> Self {
        Self {
            channel,
            provider,
            cert_storage: cert_storage.to_owned(),
            ca_cert: ca_cert.to_owned(),
            read_half: AsyncMutex::new(None),
            write_half: AsyncMutex::new(None),
        }
    }

    pub fn port(&self) -> u32 {
        self.channel.port()
    }

    /// Waits for the underlying channel, then accepts a TLS handshake over
    /// it. May be called again after an outer transport loss.
    pub async fn connect(&self) -> Result<()> {
        self.channel.connect().await?;

        debug!(port = self.port(), "accepting tls session");

        let config = self.server_config().await?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let stream = tokio::select! {
            _ = self.channel.cancel_token().cancelled() => return Err(Error::Closed),
            accepted = acceptor.accept(self.channel.stream()) => {
                accepted.map_err(|err| Error::runtime(format!("tls accept: {err}")))?
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.read_half.lock().await = Some(read_half);
        *self.write_half.lock().await = Some(write_half);

        info!(port = self.port(), "tls session established");

        Ok(())
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.read_half.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::runtime("secure channel is not connected"))?;

        let result = tokio::select! {
            _ = self.channel.cancel_token().cancelled() => Err(Error::Closed),
            read = reader.read_exact(buf) => read.map(|_| ()).map_err(Error::from),
        };

        if result.is_err() {
            guard.take();
        }

        result
    }

    pub async fn write_all(&self, message: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::runtime("secure channel is not connected"))?;

        let result = tokio::select! {
            _ = self.channel.cancel_token().cancelled() => Err(Error::Closed),
            written = async {
                writer.write_all(message).await?;
                writer.flush().await
            } => written.map_err(Error::from),
        };

        if result.is_err() {
            guard.take();
        }

        result
    }

    /// Sends the TLS close alert, then closes the underlying channel.
    pub async fn close(&self) -> Result<()> {
        debug!(port = self.port(), "closing secure channel");

        if let Some(mut writer) = self.write_half.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.read_half.lock().await.take();

        self.channel.close_channel()
    }

    async fn server_config(&self) -> Result<ServerConfig> {
        let cert_info = self.provider.certificate(&self.cert_storage).await?;

        let certs = load_certs(&location_to_path(&cert_info.cert_url)?)?;
        let key = load_key(&location_to_path(&cert_info.key_url)?)?;

        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(load_certs(&self.ca_cert)?);

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| Error::runtime(format!("client verifier: {err}")))?;

        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|err| Error::runtime(format!("server tls config: {err}")))
    }
}

#[async_trait]
impl CommChannel for SecureChannel {
    async fn connect(&self) -> Result<()> {
        SecureChannel::connect(self).await
    }

    async fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).await
    }

    async fn write(&self, message: Vec<u8>) -> Result<()> {
        self.write_all(&message).await
    }

    async fn close(&self) -> Result<()> {
        SecureChannel::close(self).await
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| Error::NotFound(format!("certificate {}: {err}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| Error::runtime(format!("parse certificates: {err}")))?;

    if certs.is_empty() {
        return Err(Error::runtime(format!(
            "no certificates in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| Error::NotFound(format!("private key {}: {err}", path.display())))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| Error::runtime(format!("parse private key: {err}")))?
        .ok_or_else(|| Error::runtime(format!("no private key in {}", path.display())))
}
