// SPDX-License-Identifier: Apache-2.0

//! CM endpoint behavior: local clock-sync answers, open-side passthrough and
//! the reconnect cache policy of the inner CM client.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;
use tokio::io::AsyncWriteExt;

use portgate::clients::cert::{CertInfo, CertProvider};
use portgate::clients::{CmClient, MessageHandler};
use portgate::comm::CommManager;
use portgate::config::{CmConfig, Config};
use portgate::endpoints::CmConnection;
use portgate::error::{Error, Result};
use portgate::proto::servicemanager::sm_incoming_messages::SmIncomingMessage;
use portgate::proto::servicemanager::sm_outgoing_messages::SmOutgoingMessage;
use portgate::proto::servicemanager::{
    Alert, ClockSyncRequest, NodeConfigStatus, SmIncomingMessages, SmOutgoingMessages,
};

use common::{
    inner_message, outer_frame, read_outer_frame, start_sm_stub, strip_inner_header,
    MemoryTransport, RecordingHandler,
};

const CM_OPEN_PORT: u32 = 3;

fn test_config(server_url: String) -> Config {
    Config {
        cm: CmConfig {
            server_url,
            open_port: CM_OPEN_PORT,
            secure_port: 4,
        },
        ..Default::default()
    }
}

fn clock_sync_request() -> Vec<u8> {
    SmOutgoingMessages {
        sm_outgoing_message: Some(SmOutgoingMessage::ClockSyncRequest(ClockSyncRequest {})),
    }
    .encode_to_vec()
}

fn node_config_status(version: &str) -> Vec<u8> {
    SmOutgoingMessages {
        sm_outgoing_message: Some(SmOutgoingMessage::NodeConfigStatus(NodeConfigStatus {
            version: version.to_owned(),
            ..Default::default()
        })),
    }
    .encode_to_vec()
}

fn alert(tag: &str) -> Vec<u8> {
    SmOutgoingMessages {
        sm_outgoing_message: Some(SmOutgoingMessage::Alert(Alert {
            tag: tag.to_owned(),
            ..Default::default()
        })),
    }
    .encode_to_vec()
}

/// Cert provider stub; never consulted on the insecure paths under test.
struct NoCerts;

#[async_trait::async_trait]
impl CertProvider for NoCerts {
    async fn certificate(&self, _cert_storage: &str) -> Result<CertInfo> {
        Err(Error::NotSupported)
    }

    async fn mtls_client_config(
        &self,
        _cert_storage: &str,
    ) -> Result<tonic::transport::ClientTlsConfig> {
        Err(Error::NotSupported)
    }

    fn tls_client_config(&self) -> Result<Option<tonic::transport::ClientTlsConfig>> {
        Ok(None)
    }
}

#[tokio::test]
async fn clock_sync_is_answered_locally() {
    let (transport, mut far) = MemoryTransport::pair().await;
    let manager = CommManager::new(transport);
    let (handler, mut forwarded) = RecordingHandler::new();

    let connection = CmConnection::start(
        &test_config("localhost:1".to_owned()),
        handler,
        &manager,
        None,
    )
    .unwrap();

    far.write_all(&outer_frame(CM_OPEN_PORT, &inner_message(&clock_sync_request())))
        .await
        .unwrap();

    let (port, payload) = read_outer_frame(&mut far).await;
    assert_eq!(port, CM_OPEN_PORT);

    let reply = SmIncomingMessages::decode(strip_inner_header(&payload).as_slice()).unwrap();
    let Some(SmIncomingMessage::ClockSync(clock_sync)) = reply.sm_incoming_message else {
        panic!("expected clock sync reply");
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let reported = clock_sync.current_time.expect("current time").seconds;
    assert!((now - reported).abs() <= 1, "clock sync drifted: {reported} vs {now}");

    // Clock-sync requests are never forwarded inward.
    assert!(forwarded.try_recv().is_err());

    connection.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn open_messages_are_forwarded_to_the_handler() {
    let (transport, mut far) = MemoryTransport::pair().await;
    let manager = CommManager::new(transport);
    let (handler, mut forwarded) = RecordingHandler::new();

    let connection = CmConnection::start(
        &test_config("localhost:1".to_owned()),
        handler,
        &manager,
        None,
    )
    .unwrap();

    let status = node_config_status("2.1");
    far.write_all(&outer_frame(CM_OPEN_PORT, &inner_message(&status)))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), forwarded.recv())
        .await
        .expect("message forwarded")
        .unwrap();
    assert_eq!(received, status);

    connection.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_cache_keeps_only_node_config_status() {
    // Reserve an address, leaving the server down for now.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = test_config(addr.to_string());
    let client = CmClient::new(&config, Arc::new(NoCerts), true).await.unwrap();

    client.on_connected().await;

    // With no live stream, the status is cached and the alert is dropped.
    client.send(node_config_status("3.0")).await.unwrap();
    client.send(alert("systemAlert")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Bring the server up; the next connection attempt replays the cache.
    let mut stub = start_sm_stub(addr).await;

    let first = tokio::time::timeout(Duration::from_secs(10), stub.inbound.recv())
        .await
        .expect("cached message replayed")
        .unwrap();

    let Some(SmOutgoingMessage::NodeConfigStatus(status)) = first.sm_outgoing_message else {
        panic!("expected node config status");
    };
    assert_eq!(status.version, "3.0");

    // The alert must not follow.
    let extra = tokio::time::timeout(Duration::from_millis(500), stub.inbound.recv()).await;
    assert!(extra.is_err(), "non-cacheable message was replayed");

    client.close().await.unwrap();
    stub.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_messages_flow_upstream_once_connected() {
    let mut stub = start_sm_stub("127.0.0.1:0".parse().unwrap()).await;

    let config = test_config(stub.url());
    let client = CmClient::new(&config, Arc::new(NoCerts), true).await.unwrap();

    client.on_connected().await;

    // Wait for the stream to come up, then send.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.send(node_config_status("4.2")).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), stub.inbound.recv())
        .await
        .expect("message delivered upstream")
        .unwrap();

    let Some(SmOutgoingMessage::NodeConfigStatus(status)) = received.sm_outgoing_message else {
        panic!("expected node config status");
    };
    assert_eq!(status.version, "4.2");

    client.close().await.unwrap();
    stub.stop();
}
