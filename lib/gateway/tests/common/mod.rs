// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the integration tests: an in-memory outer transport,
//! frame builders, a recording handler and in-process stubs for the inner
//! gRPC services.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use portgate::clients::MessageHandler;
use portgate::error::{Error, Result};
use portgate::framing::{self, INNER_HEADER_SIZE, OUTER_HEADER_SIZE};
use portgate::proto::iamanager::public_node_service_server::{
    PublicNodeService, PublicNodeServiceServer,
};
use portgate::proto::iamanager::{IamIncomingMessages, IamOutgoingMessages};
use portgate::proto::servicemanager::sm_service_server::{SmService, SmServiceServer};
use portgate::proto::servicemanager::{SmIncomingMessages, SmOutgoingMessages};
use portgate::transport::Transport;

/// In-memory outer transport; the test drives the far end of the duplex
/// pipe. Pushing another stream into the connect queue models a reconnect.
pub struct MemoryTransport {
    incoming: AsyncMutex<mpsc::Receiver<DuplexStream>>,
    reader: AsyncMutex<Option<ReadHalf<DuplexStream>>>,
    writer: AsyncMutex<Option<WriteHalf<DuplexStream>>>,
    cancel: CancellationToken,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::Sender<DuplexStream>) {
        let (tx, rx) = mpsc::channel(4);

        let transport = Arc::new(Self {
            incoming: AsyncMutex::new(rx),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        });

        (transport, tx)
    }

    /// Transport plus the test-side end of an already-queued connection.
    pub async fn pair() -> (Arc<Self>, DuplexStream) {
        let (transport, tx) = Self::new();
        let (near, far) = tokio::io::duplex(256 * 1024);
        tx.send(near).await.expect("queue connection");

        (transport, far)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        if self.reader.lock().await.is_some() {
            return Ok(());
        }

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            stream = async { self.incoming.lock().await.recv().await } => {
                stream.ok_or(Error::Closed)?
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
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
        self.cancel.cancel();
        self.reader.lock().await.take();
        self.writer.lock().await.take();

        Ok(())
    }
}

/// A complete outer frame: header plus payload.
pub fn outer_frame(port: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = framing::build_outer(port, payload).to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// An inner-framed message as carried inside an outer frame.
pub fn inner_message(message: &[u8]) -> Vec<u8> {
    let mut framed = framing::build_inner(message.len() as u32).to_vec();
    framed.extend_from_slice(message);
    framed
}

/// Reads one outer frame from the test side of the transport.
pub async fn read_outer_frame(stream: &mut DuplexStream) -> (u32, Vec<u8>) {
    let mut raw = [0u8; OUTER_HEADER_SIZE];
    stream.read_exact(&mut raw).await.expect("outer header");

    let header = framing::parse_outer(&raw).expect("parse outer header");

    let mut payload = vec![0u8; header.data_size as usize];
    stream.read_exact(&mut payload).await.expect("outer payload");

    assert_eq!(framing::checksum(&payload), header.checksum);

    (header.port, payload)
}

/// Strips the inner header from an outer frame payload.
pub fn strip_inner_header(payload: &[u8]) -> Vec<u8> {
    let header = framing::parse_inner(payload).expect("parse inner header");
    let body = &payload[INNER_HEADER_SIZE..];

    assert_eq!(body.len(), header.data_size as usize);

    body.to_vec()
}

/// Handler that records forwarded messages and serves queued replies.
pub struct RecordingHandler {
    forwarded_tx: mpsc::UnboundedSender<Vec<u8>>,
    replies: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let handler = Arc::new(Self {
            forwarded_tx,
            replies: AsyncMutex::new(replies),
            reply_tx,
        });

        (handler, forwarded_rx)
    }

    /// Queues a message for the endpoint runner's write pump.
    pub fn push_reply(&self, message: Vec<u8>) {
        self.reply_tx.send(message).expect("queue reply");
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_connected(&self) {}

    async fn on_disconnected(&self) {}

    async fn send(&self, message: Vec<u8>) -> Result<()> {
        self.forwarded_tx.send(message).map_err(|_| Error::Closed)
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        self.replies.lock().await.recv().await.ok_or(Error::Closed)
    }
}

type GrpcStream<T> = Pin<Box<dyn Stream<Item = std::result::Result<T, Status>> + Send>>;

/// CM-side stub: captures everything the gateway writes upstream and can
/// feed messages down the response stream.
struct SmStub {
    inbound_tx: mpsc::UnboundedSender<SmOutgoingMessages>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<SmIncomingMessages>>>,
}

#[tonic::async_trait]
impl SmService for SmStub {
    type RegisterSMStream = GrpcStream<SmIncomingMessages>;

    async fn register_sm(
        &self,
        request: Request<Streaming<SmOutgoingMessages>>,
    ) -> std::result::Result<Response<Self::RegisterSMStream>, Status> {
        let mut stream = request.into_inner();
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            while let Ok(Some(message)) = stream.message().await {
                if inbound_tx.send(message).is_err() {
                    break;
                }
            }
        });

        let outbound = self.outbound.lock().expect("outbound mutex").take();
        let stream: Self::RegisterSMStream = match outbound {
            Some(rx) => Box::pin(
                UnboundedReceiverStream::new(rx)
                    .map(Ok)
                    .chain(futures::stream::pending()),
            ),
            None => Box::pin(futures::stream::pending()),
        };

        Ok(Response::new(stream))
    }
}

pub struct SmStubHandle {
    pub addr: SocketAddr,
    pub inbound: mpsc::UnboundedReceiver<SmOutgoingMessages>,
    pub outbound: mpsc::UnboundedSender<SmIncomingMessages>,
    stop: Option<oneshot::Sender<()>>,
}

impl SmStubHandle {
    pub fn url(&self) -> String {
        self.addr.to_string()
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
    }
}

/// Serves the CM stub on `addr`; pass port 0 to pick a free one.
pub async fn start_sm_stub(addr: SocketAddr) -> SmStubHandle {
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind sm stub");
    let addr = listener.local_addr().expect("sm stub addr");

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let stub = SmStub {
        inbound_tx,
        outbound: Mutex::new(Some(outbound_rx)),
    };

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(SmServiceServer::new(stub))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                stop_rx.await.ok();
            })
            .await
            .ok();
    });

    SmStubHandle {
        addr,
        inbound,
        outbound: outbound_tx,
        stop: Some(stop_tx),
    }
}

/// IAM-side stub for the node registration stream.
struct NodeStub {
    inbound_tx: mpsc::UnboundedSender<IamOutgoingMessages>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<IamIncomingMessages>>>,
}

#[tonic::async_trait]
impl PublicNodeService for NodeStub {
    type RegisterNodeStream = GrpcStream<IamIncomingMessages>;

    async fn register_node(
        &self,
        request: Request<Streaming<IamOutgoingMessages>>,
    ) -> std::result::Result<Response<Self::RegisterNodeStream>, Status> {
        let mut stream = request.into_inner();
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            while let Ok(Some(message)) = stream.message().await {
                if inbound_tx.send(message).is_err() {
                    break;
                }
            }
        });

        let outbound = self.outbound.lock().expect("outbound mutex").take();
        let stream: Self::RegisterNodeStream = match outbound {
            Some(rx) => Box::pin(
                UnboundedReceiverStream::new(rx)
                    .map(Ok)
                    .chain(futures::stream::pending()),
            ),
            None => Box::pin(futures::stream::pending()),
        };

        Ok(Response::new(stream))
    }
}

pub struct NodeStubHandle {
    pub addr: SocketAddr,
    pub inbound: mpsc::UnboundedReceiver<IamOutgoingMessages>,
    pub outbound: mpsc::UnboundedSender<IamIncomingMessages>,
    stop: Option<oneshot::Sender<()>>,
}

impl NodeStubHandle {
    pub fn url(&self) -> String {
        self.addr.to_string()
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
    }
}

/// Serves the IAM node stub on `addr`; pass port 0 to pick a free one.
pub async fn start_node_stub(addr: SocketAddr) -> NodeStubHandle {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind node stub");
    let addr = listener.local_addr().expect("node stub addr");

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let stub = NodeStub {
        inbound_tx,
        outbound: Mutex::new(Some(outbound_rx)),
    };

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(PublicNodeServiceServer::new(stub))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                stop_rx.await.ok();
            })
            .await
            .ok();
    });

    NodeStubHandle {
        addr,
        inbound,
        outbound: outbound_tx,
        stop: Some(stop_tx),
    }
}
