// SPDX-License-Identifier: Apache-2.0

//! TCP server transport: one listening socket, one remote client at a time.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::Transport;

pub struct SocketTransport {
    listener: TcpListener,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl SocketTransport {
    /// Binds `0.0.0.0:<port>` with a backlog of queued clients; only one
    /// connection is served at a time.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;

        info!(port, "outer socket listening");

        Ok(Self {
            listener,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Local address of the listening socket, useful with port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        if self.reader.lock().await.is_some() {
            return Ok(());
        }

        let (stream, peer) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            accepted = self.listener.accept() => accepted?,
        };

        info!(%peer, "outer client connected");

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

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
            // Drop the half so the next connect accepts a new client.
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

        debug!("closing outer socket transport");

        self.cancel.cancel();
        self.reader.lock().await.take();

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }

        Ok(())
    }
}
