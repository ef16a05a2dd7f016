// SPDX-License-Identifier: Apache-2.0

//! Bidirectional streaming client for the CM service.
//!
//! Outgoing messages are opaque serialized envelopes; the pump decodes them
//! only far enough to decide whether an undeliverable message is worth
//! caching. Only `NodeConfigStatus` survives a dead stream here; everything
//! else is dropped with a log line. The cache is replayed in FIFO order at
//! the start of every stream lifetime, before any newly queued message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tracing::{debug, error, info, warn};

use crate::clients::cert::{service_uri, CertProvider};
use crate::clients::{MessageHandler, CACHE_CAPACITY, RECONNECT_INTERVAL, STREAM_BUFFER};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::servicemanager::sm_outgoing_messages::SmOutgoingMessage;
use crate::proto::servicemanager::sm_service_client::SmServiceClient;
use crate::proto::servicemanager::SmOutgoingMessages;

pub struct CmClient {
    url: String,
    tls: Option<ClientTlsConfig>,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    incoming_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    cache: Mutex<VecDeque<SmOutgoingMessages>>,
    stream_tx: Mutex<Option<mpsc::Sender<SmOutgoingMessages>>>,
    started: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CmClient {
    /// Builds the client and launches its connection loop and outgoing pump.
    /// Both idle until the first `on_connected`. `insecure` corresponds to
    /// provisioning mode.
    pub async fn new(
        config: &Config,
        provider: Arc<dyn CertProvider>,
        insecure: bool,
    ) -> Result<Arc<Self>> {
        info!(url = %config.cm.server_url, insecure, "initializing cm client");

        let tls = if insecure {
            None
        } else {
            Some(provider.mtls_client_config(&config.cert_storage).await?)
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(false);
        let (connected, _) = watch::channel(false);

        let client = Arc::new(Self {
            url: config.cm.server_url.clone(),
            tls,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            incoming_tx,
            incoming_rx: AsyncMutex::new(incoming_rx),
            cache: Mutex::new(VecDeque::new()),
            stream_tx: Mutex::new(None),
            started,
            connected,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(client.clone().run()),
            tokio::spawn(client.clone().pump_outgoing()),
        ];
        *client.tasks.lock().expect("task list mutex poisoned") = tasks;

        Ok(client)
    }

    /// Cancels the stream, wakes every queue waiter with `Closed` and joins
    /// both tasks. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("shutting down cm client");

        self.cancel.cancel();
        self.connected.send_replace(false);
        *self.stream_tx.lock().expect("stream tx mutex poisoned") = None;

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned"));
        for task in tasks {
            task.await.ok();
        }

        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut started = self.started.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = started.wait_for(|up| *up) => {
                if result.is_err() {
                    return;
                }
            }
        }

        debug!("cm connection loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.stream_once().await {
                Ok(()) => debug!("cm stream ended"),
                Err(err) => {
                    if !self.cancel.is_cancelled() {
                        warn!(%err, "cm connection failed");
                    }
                }
            }

            *self.stream_tx.lock().expect("stream tx mutex poisoned") = None;
            self.connected.send_replace(false);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }

        debug!("cm connection loop stopped");
    }

    async fn stream_once(&self) -> Result<()> {
        debug!(url = %self.url, "connecting to cm");

        let mut endpoint = Endpoint::from_shared(service_uri(&self.url))
            .map_err(|err| Error::InvalidArgument(format!("cm url: {err}")))?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        let channel = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            connected = endpoint.connect() => connected?,
        };

        let mut client = SmServiceClient::new(channel);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let mut inbound = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            response = client.register_sm(ReceiverStream::new(rx)) => response?.into_inner(),
        };

        info!("connected to cm");

        self.replay_cache(&tx).await?;

        *self.stream_tx.lock().expect("stream tx mutex poisoned") = Some(tx);
        self.connected.send_replace(true);

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = inbound.message() => message?,
            };

            let Some(message) = message else {
                return Ok(());
            };

            if self.incoming_tx.send(message.encode_to_vec()).is_err() {
                return Err(Error::Closed);
            }
        }
    }

    async fn replay_cache(&self, tx: &mpsc::Sender<SmOutgoingMessages>) -> Result<()> {
        loop {
            let message = self
                .cache
                .lock()
                .expect("cache mutex poisoned")
                .pop_front();
            let Some(message) = message else {
                return Ok(());
            };

            if tx.send(message.clone()).await.is_err() {
                self.cache
                    .lock()
                    .expect("cache mutex poisoned")
                    .push_front(message);

                return Err(Error::runtime("failed to replay cached message"));
            }

            debug!("cached message replayed to cm");
        }
    }

    async fn pump_outgoing(self: Arc<Self>) {
        let receiver = self
            .outgoing_rx
            .lock()
            .expect("outgoing rx mutex poisoned")
            .take();
        let Some(mut rx) = receiver else {
            return;
        };

        debug!("cm outgoing pump started");

        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let mut started = self.started.subscribe();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = started.wait_for(|up| *up) => {
                    if result.is_err() {
                        break;
                    }
                }
            }

            let message = match SmOutgoingMessages::decode(payload.as_slice()) {
                Ok(message) => message,
                Err(err) => {
                    error!(%err, "failed to parse outgoing cm message");
                    continue;
                }
            };

            let tx = self
                .stream_tx
                .lock()
                .expect("stream tx mutex poisoned")
                .clone();
            let delivered = match tx {
                Some(tx) => tx.send(message.clone()).await.is_ok(),
                None => false,
            };

            if !delivered {
                self.cache_message(message);
            }
        }

        debug!("cm outgoing pump stopped");
    }

    fn cache_message(&self, message: SmOutgoingMessages) {
        if !is_cacheable(&message) {
            warn!("dropping undeliverable cm message");
            return;
        }

        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        if cache.len() >= CACHE_CAPACITY {
            warn!("cm reconnect cache full, dropping oldest entry");
            cache.pop_front();
        }

        debug!("caching node config status for replay");
        cache.push_back(message);
    }
}

/// The one CM message kind whose loss across a reconnect must be prevented.
fn is_cacheable(message: &SmOutgoingMessages) -> bool {
    matches!(
        message.sm_outgoing_message,
        Some(SmOutgoingMessage::NodeConfigStatus(_))
    )
}

#[async_trait]
impl MessageHandler for CmClient {
    async fn on_connected(&self) {
        debug!("outer cm endpoint connected");
        self.started.send_replace(true);
    }

    async fn on_disconnected(&self) {
        self.close().await.ok();
    }

    async fn send(&self, message: Vec<u8>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        self.outgoing_tx.send(message).map_err(|_| Error::Closed)
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        let mut rx = self.incoming_rx.lock().await;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            message = rx.recv() => message.ok_or(Error::Closed),
        }
    }
}
