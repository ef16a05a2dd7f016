// SPDX-License-Identifier: Apache-2.0

//! IAM endpoint passthrough: framed envelopes on the open IAM port are
//! relayed verbatim to the node registration stream and back.

mod common;

use std::time::Duration;

use prost::Message;
use tokio::io::AsyncWriteExt;

use portgate::clients::iam::{NodeClient, NodeCredentials};
use portgate::clients::MessageHandler;
use portgate::comm::CommManager;
use portgate::endpoints::IamConnection;
use portgate::proto::iamanager::iam_incoming_messages::IamIncomingMessage;
use portgate::proto::iamanager::iam_outgoing_messages::IamOutgoingMessage;
use portgate::proto::iamanager::{
    IamIncomingMessages, IamOutgoingMessages, StartProvisioningRequest,
    StartProvisioningResponse,
};

use common::{
    inner_message, outer_frame, read_outer_frame, start_node_stub, strip_inner_header,
    MemoryTransport,
};

const IAM_OPEN_PORT: u32 = 1;

#[tokio::test(flavor = "multi_thread")]
async fn open_iam_messages_pass_through_both_ways() {
    let mut stub = start_node_stub("127.0.0.1:0".parse().unwrap()).await;

    let client = NodeClient::start(stub.url(), vec![NodeCredentials::Insecure], "iam-public");

    let (transport, mut far) = MemoryTransport::pair().await;
    let manager = CommManager::new(transport);

    let connection = IamConnection::start(&manager, IAM_OPEN_PORT, client.clone()).unwrap();

    // Outer to inner: a framed provisioning response reaches the stub.
    let outgoing = IamOutgoingMessages {
        iam_outgoing_message: Some(IamOutgoingMessage::StartProvisioningResponse(
            StartProvisioningResponse { error: None },
        )),
    };

    far.write_all(&outer_frame(
        IAM_OPEN_PORT,
        &inner_message(&outgoing.encode_to_vec()),
    ))
    .await
    .unwrap();

    let upstream = tokio::time::timeout(Duration::from_secs(10), stub.inbound.recv())
        .await
        .expect("message relayed upstream")
        .unwrap();
    assert_eq!(upstream, outgoing);

    // Inner to outer: a provisioning request comes back framed on the port.
    let incoming = IamIncomingMessages {
        iam_incoming_message: Some(IamIncomingMessage::StartProvisioningRequest(
            StartProvisioningRequest {
                node_id: "node-1".to_owned(),
                password: "secret".to_owned(),
            },
        )),
    };
    stub.outbound.send(incoming.clone()).unwrap();

    let (port, payload) = read_outer_frame(&mut far).await;
    assert_eq!(port, IAM_OPEN_PORT);

    let relayed = IamIncomingMessages::decode(strip_inner_header(&payload).as_slice()).unwrap();
    assert_eq!(relayed, incoming);

    connection.close().await.unwrap();
    manager.close().await.unwrap();
    stub.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn iam_messages_sent_while_disconnected_are_replayed() {
    // Server down: reserve an address only.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = NodeClient::start(
        addr.to_string(),
        vec![NodeCredentials::Insecure],
        "iam-public",
    );

    client.on_connected().await;

    let first = IamOutgoingMessages {
        iam_outgoing_message: Some(IamOutgoingMessage::StartProvisioningResponse(
            StartProvisioningResponse { error: None },
        )),
    };
    client.send(first.encode_to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Unlike the CM side, every IAM message survives the outage.
    let mut stub = start_node_stub(addr).await;

    let replayed = tokio::time::timeout(Duration::from_secs(10), stub.inbound.recv())
        .await
        .expect("cached iam message replayed")
        .unwrap();
    assert_eq!(replayed, first);

    client.close().await.unwrap();
    stub.stop();
}
