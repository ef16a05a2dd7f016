// SPDX-License-Identifier: Apache-2.0

//! Inter-domain channel transport.
//!
//! The channel is exposed to this process as two path-bound stream endpoints,
//! one per direction, tagged with the numeric identifier of the peer domain.
//! Reads come from the RX endpoint, writes go to the TX endpoint.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::VChanConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;

pub struct StreamPairTransport {
    domain: u32,
    rx_path: PathBuf,
    tx_path: PathBuf,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl StreamPairTransport {
    pub fn new(config: &VChanConfig) -> Self {
        Self {
            domain: config.domain,
            rx_path: config.rx_path.clone(),
            tx_path: config.tx_path.clone(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for StreamPairTransport {
    async fn connect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        if self.reader.lock().await.is_some() {
            return Ok(());
        }

        debug!(
            domain = self.domain,
            rx = %self.rx_path.display(),
            tx = %self.tx_path.display(),
            "connecting inter-domain channel"
        );

        let rx = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            stream = UnixStream::connect(&self.rx_path) => stream?,
        };
        let tx = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            stream = UnixStream::connect(&self.tx_path) => stream?,
        };

        let (read_half, _) = rx.into_split();
        let (_, write_half) = tx.into_split();

        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

        info!(domain = self.domain, "inter-domain channel connected");

        Ok(())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::Closed)?;

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            read = reader.read_exact(buf) => read.map(|_| ()).map_err(Error::from),
        };

        if result.is_err() {
            guard.take();
            self.writer.lock().await.take();
        }

        result
    }

    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::Closed)?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            written = writer.write_all(buf) => written.map_err(Error::from),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        debug!(domain = self.domain, "closing inter-domain channel");

        self.cancel.cancel();
        self.reader.lock().await.take();

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn connects_both_directions_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let rx_path = dir.path().join("rx.sock");
        let tx_path = dir.path().join("tx.sock");

        let rx_listener = UnixListener::bind(&rx_path).unwrap();
        let tx_listener = UnixListener::bind(&tx_path).unwrap();

        let peer = tokio::spawn(async move {
            let (mut rx_side, _) = rx_listener.accept().await.unwrap();
            let (mut tx_side, _) = tx_listener.accept().await.unwrap();

            rx_side.write_all(b"inbound").await.unwrap();

            let mut buf = [0u8; 8];
            tx_side.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = StreamPairTransport::new(&VChanConfig {
            domain: 1,
            rx_path,
            tx_path,
            ..Default::default()
        });

        transport.connect().await.unwrap();

        let mut buf = [0u8; 7];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"inbound");

        transport.write_all(b"outbound").await.unwrap();
        assert_eq!(&peer.await.unwrap(), b"outbound");
    }
}
