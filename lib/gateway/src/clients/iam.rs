// SPDX-License-Identifier: Apache-2.0

//! Bidirectional streaming clients for the IAM node services.
//!
//! Two instances of [`NodeClient`] run side by side: one toward the public
//! server (insecure first, TLS when a CA is configured) and one toward the
//! protected server (mTLS only, skipped in provisioning mode). Unlike the CM
//! side, every undeliverable IAM message is cached for replay.

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

use crate::clients::cert::{service_uri, CertProvider, IamCertSource};
use crate::clients::{MessageHandler, CACHE_CAPACITY, RECONNECT_INTERVAL, STREAM_BUFFER};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::iamanager::public_node_service_client::PublicNodeServiceClient;
use crate::proto::iamanager::IamOutgoingMessages;

/// One entry of a node client's ordered credential list.
#[derive(Clone)]
pub enum NodeCredentials {
    Insecure,
    Tls(ClientTlsConfig),
}

/// IAM-side umbrella: the certificate provider plus the node clients.
pub struct IamClient {
    source: Arc<IamCertSource>,
    public: Arc<NodeClient>,
    protected: Option<Arc<NodeClient>>,
}

impl IamClient {
    pub async fn new(config: &Config, provisioning: bool) -> Result<Self> {
        info!(provisioning, "initializing iam client");

        let source = Arc::new(IamCertSource::new(config, provisioning));

        let mut public_credentials = vec![NodeCredentials::Insecure];
        if let Some(tls) = source.tls_client_config()? {
            public_credentials.push(NodeCredentials::Tls(tls));
        }

        let public = NodeClient::start(
            config.iam.public_server_url.clone(),
            public_credentials,
            "iam-public",
        );

        let protected = if provisioning {
            None
        } else {
            let tls = source.mtls_client_config(&config.iam.cert_storage).await?;

            Some(NodeClient::start(
                config.iam.protected_server_url.clone(),
                vec![NodeCredentials::Tls(tls)],
                "iam-protected",
            ))
        };

        Ok(Self {
            source,
            public,
            protected,
        })
    }

    pub fn cert_provider(&self) -> Arc<dyn CertProvider> {
        self.source.clone()
    }

    pub fn public_handler(&self) -> Arc<NodeClient> {
        self.public.clone()
    }

    pub fn protected_handler(&self) -> Option<Arc<NodeClient>> {
        self.protected.clone()
    }

    pub async fn close(&self) -> Result<()> {
        self.public.close().await?;

        if let Some(protected) = &self.protected {
            protected.close().await?;
        }

        Ok(())
    }
}

pub struct NodeClient {
    url: String,
    credentials: Vec<NodeCredentials>,
    label: &'static str,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    incoming_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    cache: Mutex<VecDeque<IamOutgoingMessages>>,
    stream_tx: Mutex<Option<mpsc::Sender<IamOutgoingMessages>>>,
    started: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NodeClient {
    /// Launches the connection loop and outgoing pump; both idle until the
    /// first `on_connected`.
    pub fn start(
        url: String,
        credentials: Vec<NodeCredentials>,
        label: &'static str,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(false);
        let (connected, _) = watch::channel(false);

        let client = Arc::new(Self {
            url,
            credentials,
            label,
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

        client
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(label = self.label, "shutting down node client");

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

        debug!(label = self.label, "node client connection loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(err) = self.register_node().await {
                if !self.cancel.is_cancelled() {
                    warn!(label = self.label, %err, "failed to register node");
                }
            }

            *self.stream_tx.lock().expect("stream tx mutex poisoned") = None;
            self.connected.send_replace(false);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }

        debug!(label = self.label, "node client connection loop stopped");
    }

    /// Tries each credential of the ordered list in turn; a stream that ends
    /// cleanly falls through to the next entry, same as a failed attempt.
    async fn register_node(&self) -> Result<()> {
        for credentials in &self.credentials {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.stream_once(credentials).await {
                Ok(()) => debug!(label = self.label, "node stream ended"),
                Err(err) => warn!(label = self.label, %err, "node stream attempt failed"),
            }

            *self.stream_tx.lock().expect("stream tx mutex poisoned") = None;
            self.connected.send_replace(false);
        }

        Err(Error::runtime("all credentials exhausted"))
    }

    async fn stream_once(&self, credentials: &NodeCredentials) -> Result<()> {
        debug!(label = self.label, url = %self.url, "connecting to iam");

        let mut endpoint = Endpoint::from_shared(service_uri(&self.url))
            .map_err(|err| Error::InvalidArgument(format!("iam url: {err}")))?;
        if let NodeCredentials::Tls(tls) = credentials {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        let channel = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            connected = endpoint.connect() => connected?,
        };

        let mut client = PublicNodeServiceClient::new(channel);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let mut inbound = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            response = client.register_node(ReceiverStream::new(rx)) => response?.into_inner(),
        };

        info!(label = self.label, "connected to iam");

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

    async fn replay_cache(&self, tx: &mpsc::Sender<IamOutgoingMessages>) -> Result<()> {
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

            debug!(label = self.label, "cached message replayed to iam");
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

        debug!(label = self.label, "iam outgoing pump started");

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

            let message = match IamOutgoingMessages::decode(payload.as_slice()) {
                Ok(message) => message,
                Err(err) => {
                    error!(label = self.label, %err, "failed to parse outgoing iam message");
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

        debug!(label = self.label, "iam outgoing pump stopped");
    }

    /// Every IAM message is worth replaying; the bound only guards memory.
    fn cache_message(&self, message: IamOutgoingMessages) {
        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        if cache.len() >= CACHE_CAPACITY {
            warn!(
                label = self.label,
                "iam reconnect cache full, dropping oldest entry"
            );
            cache.pop_front();
        }

        debug!(label = self.label, "caching iam message for replay");
        cache.push_back(message);
    }
}

#[async_trait]
impl MessageHandler for NodeClient {
    async fn on_connected(&self) {
        debug!(label = self.label, "outer iam endpoint connected");
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
