// SPDX-License-Identifier: Apache-2.0

//! Per-port sub-stream of the outer transport.
//!
//! The mux appends inbound payload bytes to the channel's receive buffer;
//! readers drain it in delivery order. Writes prepend an outer header and go
//! through the mux's frame lock so frames from different ports never
//! interleave on the wire.
//!
//! [`ChannelStream`] adapts the same channel to `AsyncRead`/`AsyncWrite` so a
//! TLS session can use it as its byte sink and source. Stream writes are
//! pumped through the shared frame lock by a per-channel task, preserving
//! frame atomicity and per-channel order.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::comm::mux::FrameWriter;
use crate::comm::CommChannel;
use crate::error::{Error, Result};

pub(crate) struct ChannelShared {
    port: u32,
    rx: Mutex<RxState>,
    out_tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

struct RxState {
    pending: BytesMut,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelShared {
    pub(crate) fn port(&self) -> u32 {
        self.port
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn new(
        port: u32,
        rx: mpsc::UnboundedReceiver<Bytes>,
        out_tx: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            rx: Mutex::new(RxState {
                pending: BytesMut::new(),
                rx,
            }),
            out_tx,
            cancel,
        }
    }

    /// Copies up to `buf.remaining()` buffered bytes; polls the mux feed when
    /// the staging buffer runs dry. An exhausted feed reads as EOF.
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.rx.lock().expect("channel rx mutex poisoned");

        loop {
            if !state.pending.is_empty() {
                let take = buf.remaining().min(state.pending.len());
                buf.put_slice(&state.pending.split_to(take));
                return Poll::Ready(Ok(()));
            }

            match state.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => state.pending.extend_from_slice(&chunk),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Like [`poll_read`] but fills `buf` completely, tracking progress in
    /// `filled` across polls. EOF before the buffer is full is `Closed`.
    fn poll_read_exact(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
        filled: &mut usize,
    ) -> Poll<Result<()>> {
        let mut state = self.rx.lock().expect("channel rx mutex poisoned");

        loop {
            let need = buf.len() - *filled;
            if need == 0 {
                return Poll::Ready(Ok(()));
            }

            if !state.pending.is_empty() {
                let take = need.min(state.pending.len());
                let chunk = state.pending.split_to(take);
                buf[*filled..*filled + take].copy_from_slice(&chunk);
                *filled += take;
                continue;
            }

            match state.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => state.pending.extend_from_slice(&chunk),
                Poll::Ready(None) => return Poll::Ready(Err(Error::Closed)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Reader/writer handle for one port, created by the mux.
pub struct Channel {
    shared: Arc<ChannelShared>,
    writer: FrameWriter,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, writer: FrameWriter) -> Self {
        Self { shared, writer }
    }

    pub fn port(&self) -> u32 {
        self.shared.port
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// A cheap `AsyncRead + AsyncWrite` view over this channel.
    pub fn stream(&self) -> ChannelStream {
        ChannelStream {
            shared: self.shared.clone(),
        }
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut filled = 0usize;
        let shared = &self.shared;

        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Error::Closed),
            result = futures::future::poll_fn(|cx| shared.poll_read_exact(cx, buf, &mut filled)) => {
                result
            }
        }
    }

    pub async fn write_message(&self, message: &[u8]) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        self.writer.write_frame(self.shared.port, message).await
    }

    pub fn close_channel(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        debug!(port = self.shared.port, "closing channel");
        self.shared.cancel.cancel();

        Ok(())
    }
}

#[async_trait]
impl CommChannel for Channel {
    async fn connect(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Error::Closed),
            connected = self.writer.wait_connected() => connected,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).await
    }

    async fn write(&self, message: Vec<u8>) -> Result<()> {
        self.write_message(&message).await
    }

    async fn close(&self) -> Result<()> {
        self.close_channel()
    }
}

/// `AsyncRead`/`AsyncWrite` adapter used as the TLS session's byte sink and
/// source. Reads drain the mux-fed buffer; writes enqueue chunks for the
/// channel's outbound pump.
pub struct ChannelStream {
    shared: Arc<ChannelShared>,
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.shared.cancel.is_cancelled() {
            return Poll::Ready(Ok(()));
        }

        self.shared.poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.cancel.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        self.shared
            .out_tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
