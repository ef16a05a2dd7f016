// SPDX-License-Identifier: Apache-2.0

//! CM endpoint runner.
//!
//! Owns two channels toward the outer side. The open channel only answers
//! clock-sync requests locally and forwards everything else inward; it has
//! no writer pump. The secure channel relays both directions and peeks for
//! image content requests, each of which spawns a transient download job
//! whose outcome is reported back through the same secure channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use prost::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::cert::CertProvider;
use crate::clients::MessageHandler;
use crate::comm::{Channel, CommChannel, CommManager, SecureChannel, CONNECTION_TIMEOUT};
use crate::config::Config;
use crate::downloader::Downloader;
use crate::endpoints::{read_message, send_message};
use crate::error::{Error, Result};
use crate::image::{chunk_files, ContentInfo, ImageUnpacker};
use crate::proto::servicemanager::sm_incoming_messages::SmIncomingMessage;
use crate::proto::servicemanager::sm_outgoing_messages::SmOutgoingMessage;
use crate::proto::servicemanager::{
    ClockSync, ErrorInfo, ImageContent, ImageContentInfo, ImageContentRequest, ImageFile,
    SmIncomingMessages, SmOutgoingMessages,
};

pub struct CmConnection {
    handler: Arc<dyn MessageHandler>,
    open: Arc<Channel>,
    secure: Option<Arc<SecureChannel>>,
    downloader: Option<Arc<Downloader>>,
    unpacker: Option<Arc<ImageUnpacker>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CmConnection {
    /// Creates the CM channels and launches the connect loops. Without a
    /// cert provider (provisioning mode) only the open channel is run and
    /// the image pipeline stays disabled.
    pub fn start(
        config: &Config,
        handler: Arc<dyn MessageHandler>,
        manager: &CommManager,
        cert_provider: Option<Arc<dyn CertProvider>>,
    ) -> Result<Arc<Self>> {
        debug!("init cm connection");

        let open = Arc::new(manager.create_channel(config.cm.open_port)?);

        let (secure, downloader, unpacker) = match cert_provider {
            None => (None, None, None),
            Some(provider) => {
                debug!(
                    port = config.cm.secure_port,
                    cert_storage = %config.vchan.sm_cert_storage,
                    "create cm secure channel"
                );

                let secure = manager.create_secure_channel(
                    config.cm.secure_port,
                    provider,
                    &config.vchan.sm_cert_storage,
                    &config.ca_cert,
                )?;

                (
                    Some(Arc::new(secure)),
                    Some(Arc::new(Downloader::new(&config.downloader)?)),
                    Some(Arc::new(ImageUnpacker::new(&config.image_store_dir)?)),
                )
            }
        };

        let connection = Arc::new(Self {
            handler,
            open,
            secure,
            downloader,
            unpacker,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = vec![tokio::spawn(connection.clone().run_open())];
        if connection.secure.is_some() {
            tasks.push(tokio::spawn(connection.clone().run_secure()));
        }
        *connection.tasks.lock().expect("task list mutex poisoned") = tasks;

        Ok(connection)
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("close cm connection");

        self.cancel.cancel();
        self.open.close_channel().ok();

        if let Some(secure) = &self.secure {
            self.handler.on_disconnected().await;
            secure.close().await.ok();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned"));
        for task in tasks {
            task.await.ok();
        }

        debug!("cm connection closed");

        Ok(())
    }

    async fn run_open(self: Arc<Self>) {
        debug!("run cm open channel");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(err) = CommChannel::connect(self.open.as_ref()).await {
                if self.cancel.is_cancelled() {
                    break;
                }

                warn!(%err, "failed to connect cm open channel");

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(CONNECTION_TIMEOUT) => {}
                }

                continue;
            }

            if let Err(err) = self.open_read_loop().await {
                if !self.cancel.is_cancelled() {
                    warn!(%err, "cm open channel read ended");
                }
            }
        }

        debug!("cm open channel stopped");
    }

    async fn open_read_loop(&self) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = read_message(self.open.as_ref()) => message?,
            };

            let envelope = match SmOutgoingMessages::decode(message.as_slice()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(%err, "failed to parse open cm message");
                    continue;
                }
            };

            if matches!(
                envelope.sm_outgoing_message,
                Some(SmOutgoingMessage::ClockSyncRequest(_))
            ) {
                if let Err(err) = self.send_clock_sync().await {
                    error!(%err, "failed to send clock sync");
                }

                continue;
            }

            self.handler.send(message).await?;
        }
    }

    async fn send_clock_sync(&self) -> Result<()> {
        debug!("send clock sync");

        let reply = SmIncomingMessages {
            sm_incoming_message: Some(SmIncomingMessage::ClockSync(ClockSync {
                current_time: Some(prost_types::Timestamp::from(std::time::SystemTime::now())),
            })),
        };

        send_message(self.open.as_ref(), reply.encode_to_vec()).await
    }

    async fn run_secure(self: Arc<Self>) {
        let Some(secure) = self.secure.clone() else {
            return;
        };

        debug!("run cm secure channel");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(err) = secure.connect().await {
                if self.cancel.is_cancelled() {
                    break;
                }

                warn!(%err, "failed to connect cm secure channel");

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(CONNECTION_TIMEOUT) => {}
                }

                continue;
            }

            self.handler.on_connected().await;

            info!("cm secure channel connected");

            // Either pump ending tears the session down so both restart
            // together from the next handshake.
            let session = self.cancel.child_token();
            let read = tokio::spawn(self.clone().secure_read_loop(session.clone()));
            let write = tokio::spawn(self.clone().secure_write_loop(session));

            read.await.ok();
            write.await.ok();
        }

        debug!("cm secure channel stopped");
    }

    async fn secure_read_loop(self: Arc<Self>, session: CancellationToken) {
        let Some(secure) = self.secure.clone() else {
            return;
        };

        debug!("cm secure read pump started");

        loop {
            let message = tokio::select! {
                _ = session.cancelled() => break,
                message = read_message(secure.as_ref()) => match message {
                    Ok(message) => message,
                    Err(err) => {
                        if !session.is_cancelled() {
                            error!(%err, "failed to read secure cm message");
                        }
                        break;
                    }
                },
            };

            let envelope = match SmOutgoingMessages::decode(message.as_slice()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(%err, "failed to parse secure cm message");
                    continue;
                }
            };

            if let Some(SmOutgoingMessage::ImageContentRequest(request)) =
                envelope.sm_outgoing_message
            {
                debug!(
                    url = %request.url,
                    request_id = request.request_id,
                    "image content request received"
                );

                tokio::spawn(self.clone().download(request));

                continue;
            }

            if let Err(err) = self.handler.send(message).await {
                error!(%err, "failed to forward secure cm message");
                break;
            }
        }

        session.cancel();

        debug!("cm secure read pump stopped");
    }

    async fn secure_write_loop(self: Arc<Self>, session: CancellationToken) {
        let Some(secure) = self.secure.clone() else {
            return;
        };

        debug!("cm secure write pump started");

        loop {
            let message = tokio::select! {
                _ = session.cancelled() => break,
                message = self.handler.receive() => match message {
                    Ok(message) => message,
                    Err(err) => {
                        if !session.is_cancelled() {
                            error!(%err, "failed to receive cm message");
                        }
                        break;
                    }
                },
            };

            if let Err(err) = send_message(secure.as_ref(), message).await {
                error!(%err, "failed to write secure cm message");
                break;
            }
        }

        session.cancel();

        debug!("cm secure write pump stopped");
    }

    async fn download(self: Arc<Self>, request: ImageContentRequest) {
        if let Err(err) = self.fetch_and_send(&request).await {
            error!(
                %err,
                request_id = request.request_id,
                "image content request failed"
            );

            if let Err(err) = self
                .send_failed_content_info(request.request_id, &err)
                .await
            {
                error!(%err, "failed to report image content failure");
            }
        }
    }

    async fn fetch_and_send(&self, request: &ImageContentRequest) -> Result<()> {
        let downloader = self.downloader.as_ref().ok_or(Error::NotSupported)?;
        let unpacker = self.unpacker.as_ref().ok_or(Error::NotSupported)?;

        let archive = downloader.download(&request.url).await?;
        let unpacked = unpacker.unpack(&archive, &request.content_type).await?;

        let request_id = request.request_id;
        let content =
            tokio::task::spawn_blocking(move || chunk_files(&unpacked, request_id))
                .await
                .map_err(|err| Error::runtime(format!("chunker task: {err}")))??;

        self.send_content_info(content).await?;

        debug!(request_id, "image content sent");

        Ok(())
    }

    async fn send_content_info(&self, content: ContentInfo) -> Result<()> {
        let Some(secure) = &self.secure else {
            return Err(Error::NotSupported);
        };

        let info = SmIncomingMessages {
            sm_incoming_message: Some(SmIncomingMessage::ImageContentInfo(ImageContentInfo {
                request_id: content.request_id,
                image_files: content
                    .image_files
                    .into_iter()
                    .map(|file| ImageFile {
                        relative_path: file.relative_path,
                        sha256: file.sha256,
                        size: file.size,
                    })
                    .collect(),
                error: None,
            })),
        };

        send_message(secure.as_ref(), info.encode_to_vec()).await?;

        for part in content.image_contents {
            let message = SmIncomingMessages {
                sm_incoming_message: Some(SmIncomingMessage::ImageContent(ImageContent {
                    request_id: part.request_id,
                    relative_path: part.relative_path,
                    parts_count: part.parts_count,
                    part: part.part,
                    data: part.data,
                })),
            };

            send_message(secure.as_ref(), message.encode_to_vec()).await?;
        }

        Ok(())
    }

    async fn send_failed_content_info(&self, request_id: u64, err: &Error) -> Result<()> {
        let Some(secure) = &self.secure else {
            return Err(Error::NotSupported);
        };

        warn!(request_id, %err, "sending failed image content response");

        let info = SmIncomingMessages {
            sm_incoming_message: Some(SmIncomingMessage::ImageContentInfo(ImageContentInfo {
                request_id,
                image_files: Vec::new(),
                error: Some(ErrorInfo {
                    code: err.wire_code(),
                    message: err.to_string(),
                }),
            })),
        };

        send_message(secure.as_ref(), info.encode_to_vec()).await
    }
}
