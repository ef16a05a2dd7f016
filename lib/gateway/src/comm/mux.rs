// SPDX-License-Identifier: Apache-2.0

//! Outer mux: owns the single byte-stream transport and the port registry.
//!
//! One dedicated reader task demultiplexes inbound frames to channels by the
//! port carried in the outer header. Frames with an oversized `data_size`, a
//! checksum mismatch or an unknown port are dropped with a log line and the
//! reader continues; only transport errors end the read loop, after which the
//! mux reconnects with a bounded backoff.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clients::cert::CertProvider;
use crate::comm::channel::{Channel, ChannelShared};
use crate::comm::secure::SecureChannel;
use crate::comm::{CONNECTION_TIMEOUT, RECONNECT_TIMEOUT};
use crate::error::{Error, Result};
use crate::framing::{self, MAX_FRAME_SIZE, OUTER_HEADER_SIZE};
use crate::transport::Transport;

pub struct CommManager {
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    frame_lock: Arc<AsyncMutex<()>>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl CommManager {
    /// Creates the mux and starts its reader task.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);

        let manager = Arc::new(Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            frame_lock: Arc::new(AsyncMutex::new(())),
            connected,
            cancel: CancellationToken::new(),
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(manager.clone().run());
        *manager
            .reader_task
            .lock()
            .expect("reader task mutex poisoned") = Some(task);

        manager
    }

    /// Registers a plain channel for `port`.
    pub fn create_channel(&self, port: u32) -> Result<Channel> {
        debug!(port, "create open channel");

        let (shared, out_rx) = self.register(port)?;
        let writer = self.frame_writer();

        tokio::spawn(out_pump(shared.clone(), writer.clone(), out_rx));

        Ok(Channel::new(shared, writer))
    }

    /// Registers a channel for `port` and wraps it in a TLS overlay using
    /// certificates from `provider`.
    pub fn create_secure_channel(
        &self,
        port: u32,
        provider: Arc<dyn CertProvider>,
        cert_storage: &str,
        ca_cert: &Path,
    ) -> Result<SecureChannel> {
        debug!(port, cert_storage, "create secure channel");

        let channel = self.create_channel(port)?;

        Ok(SecureChannel::new(channel, provider, cert_storage, ca_cert))
    }

    /// Blocks until the outer transport is connected.
    pub async fn connect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut connected = self.connected.subscribe();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            result = connected.wait_for(|up| *up) => {
                result.map(|_| ()).map_err(|_| Error::Closed)
            }
        }
    }

    /// The mux is not itself a writable channel; all writes go through the
    /// channels it creates.
    pub async fn write(&self, _message: Vec<u8>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Shuts the mux down: closes the transport, releases every channel
    /// waiter and joins the reader task. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        debug!("closing outer mux");

        self.cancel.cancel();
        self.connected.send_replace(false);
        self.transport.close().await.ok();
        self.channels
            .lock()
            .expect("channel registry mutex poisoned")
            .clear();

        let task = self
            .reader_task
            .lock()
            .expect("reader task mutex poisoned")
            .take();
        if let Some(task) = task {
            task.await.ok();
        }

        Ok(())
    }

    fn register(
        &self,
        port: u32,
    ) -> Result<(Arc<ChannelShared>, mpsc::UnboundedReceiver<Bytes>)> {
        let mut channels = self
            .channels
            .lock()
            .expect("channel registry mutex poisoned");

        if channels.contains_key(&port) {
            return Err(Error::AlreadyExist(format!("port {port}")));
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        channels.insert(port, in_tx);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared::new(
            port,
            in_rx,
            out_tx,
            self.cancel.child_token(),
        ));

        Ok((shared, out_rx))
    }

    fn frame_writer(&self) -> FrameWriter {
        FrameWriter {
            transport: self.transport.clone(),
            frame_lock: self.frame_lock.clone(),
            connected: self.connected.clone(),
            cancel: self.cancel.clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        debug!("outer mux reader started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(err) = self.transport.connect().await {
                if self.cancel.is_cancelled() {
                    break;
                }

                warn!(%err, "failed to connect outer transport");

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_TIMEOUT) => {}
                }

                continue;
            }

            self.connected.send_replace(true);

            if let Err(err) = self.read_loop().await {
                if !self.cancel.is_cancelled() {
                    warn!(%err, "outer read loop ended");
                }
            }

            self.connected.send_replace(false);
        }

        debug!("outer mux reader stopped");
    }

    async fn read_loop(&self) -> Result<()> {
        loop {
            let mut raw = [0u8; OUTER_HEADER_SIZE];
            self.transport.read_exact(&mut raw).await?;

            let header = framing::parse_outer(&raw)?;
            let size = header.data_size as usize;

            if size > MAX_FRAME_SIZE {
                error!(port = header.port, size, "oversized frame dropped");
                continue;
            }

            let mut payload = vec![0u8; size];
            self.transport.read_exact(&mut payload).await?;

            if framing::checksum(&payload) != header.checksum {
                error!(port = header.port, size, "frame checksum mismatch");
                continue;
            }

            let sender = self
                .channels
                .lock()
                .expect("channel registry mutex poisoned")
                .get(&header.port)
                .cloned();

            match sender {
                None => error!(port = header.port, "frame for unknown port dropped"),
                Some(tx) => {
                    if tx.send(Bytes::from(payload)).is_err() {
                        debug!(port = header.port, "channel receiver gone");
                    }
                }
            }
        }
    }
}

/// Shared write path handed to every channel: waits for the transport, then
/// emits `{header, payload}` as one critical section under the frame lock.
#[derive(Clone)]
pub(crate) struct FrameWriter {
    transport: Arc<dyn Transport>,
    frame_lock: Arc<AsyncMutex<()>>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl FrameWriter {
    pub(crate) async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected.subscribe();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            result = connected.wait_for(|up| *up) => {
                result.map(|_| ()).map_err(|_| Error::Closed)
            }
        }
    }

    pub(crate) async fn write_frame(&self, port: u32, payload: &[u8]) -> Result<()> {
        match tokio::time::timeout(CONNECTION_TIMEOUT, self.wait_connected()).await {
            Err(_) => return Err(Error::Timeout),
            Ok(result) => result?,
        }

        let header = framing::build_outer(port, payload);

        let _guard = self.frame_lock.lock().await;
        self.transport.write_all(&header).await?;
        self.transport.write_all(payload).await
    }
}

/// Forwards chunks queued by a [`ChannelStream`] onto the wire.
async fn out_pump(
    shared: Arc<ChannelShared>,
    writer: FrameWriter,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let chunk = tokio::select! {
            _ = shared.cancel_token().cancelled() => break,
            chunk = out_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if let Err(err) = writer.write_frame(shared.port(), &chunk).await {
            warn!(port = shared.port(), %err, "dropping outbound chunk");
        }
    }
}
