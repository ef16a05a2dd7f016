// SPDX-License-Identifier: Apache-2.0

//! IAM endpoint runner: a single channel, plain or secure, pumped verbatim
//! in both directions between the outer side and the handler. No peeks.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::cert::CertProvider;
use crate::clients::MessageHandler;
use crate::comm::{CommChannel, CommManager, CONNECTION_TIMEOUT};
use crate::endpoints::{read_message, send_message};
use crate::error::Result;

pub struct IamConnection {
    handler: Arc<dyn MessageHandler>,
    channel: Arc<dyn CommChannel>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IamConnection {
    /// Runner over a plain channel (the public IAM port).
    pub fn start(
        manager: &CommManager,
        port: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>> {
        debug!(port, "init iam connection");

        let channel: Arc<dyn CommChannel> = Arc::new(manager.create_channel(port)?);

        Ok(Self::launch(channel, handler))
    }

    /// Runner over a TLS-wrapped channel (the protected IAM port).
    pub fn start_secure(
        manager: &CommManager,
        port: u32,
        handler: Arc<dyn MessageHandler>,
        provider: Arc<dyn CertProvider>,
        cert_storage: &str,
        ca_cert: &Path,
    ) -> Result<Arc<Self>> {
        debug!(port, cert_storage, "init secure iam connection");

        let channel: Arc<dyn CommChannel> =
            Arc::new(manager.create_secure_channel(port, provider, cert_storage, ca_cert)?);

        Ok(Self::launch(channel, handler))
    }

    fn launch(channel: Arc<dyn CommChannel>, handler: Arc<dyn MessageHandler>) -> Arc<Self> {
        let connection = Arc::new(Self {
            handler,
            channel,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(connection.clone().run());
        connection
            .tasks
            .lock()
            .expect("task list mutex poisoned")
            .push(task);

        connection
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("close iam connection");

        self.handler.on_disconnected().await;
        self.channel.close().await.ok();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned"));
        for task in tasks {
            task.await.ok();
        }

        debug!("iam connection closed");

        Ok(())
    }

    async fn run(self: Arc<Self>) {
        debug!("run iam connection");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(err) = self.channel.connect().await {
                if self.cancel.is_cancelled() {
                    break;
                }

                warn!(%err, "failed to connect iam channel");

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(CONNECTION_TIMEOUT) => {}
                }

                continue;
            }

            self.handler.on_connected().await;

            info!("iam channel connected");

            let session = self.cancel.child_token();
            let read = tokio::spawn(self.clone().read_loop(session.clone()));
            let write = tokio::spawn(self.clone().write_loop(session));

            read.await.ok();
            write.await.ok();
        }

        debug!("iam connection stopped");
    }

    async fn read_loop(self: Arc<Self>, session: CancellationToken) {
        debug!("iam read pump started");

        loop {
            let message = tokio::select! {
                _ = session.cancelled() => break,
                message = read_message(self.channel.as_ref()) => match message {
                    Ok(message) => message,
                    Err(err) => {
                        if !session.is_cancelled() {
                            error!(%err, "failed to read iam message");
                        }
                        break;
                    }
                },
            };

            if let Err(err) = self.handler.send(message).await {
                error!(%err, "failed to forward iam message");
                break;
            }
        }

        session.cancel();

        debug!("iam read pump stopped");
    }

    async fn write_loop(self: Arc<Self>, session: CancellationToken) {
        debug!("iam write pump started");

        loop {
            let message = tokio::select! {
                _ = session.cancelled() => break,
                message = self.handler.receive() => match message {
                    Ok(message) => message,
                    Err(err) => {
                        if !session.is_cancelled() {
                            error!(%err, "failed to receive iam message");
                        }
                        break;
                    }
                },
            };

            if let Err(err) = send_message(self.channel.as_ref(), message).await {
                error!(%err, "failed to write iam message");
                break;
            }
        }

        session.cancel();

        debug!("iam write pump stopped");
    }
}
