// SPDX-License-Identifier: Apache-2.0

//! Per-endpoint connection runners: pump inner-framed messages between the
//! outer channels and the inner gRPC clients.

pub mod cm;
pub mod iam;

pub use cm::CmConnection;
pub use iam::IamConnection;

use crate::comm::CommChannel;
use crate::error::Result;
use crate::framing::{self, INNER_HEADER_SIZE};

/// Reads one inner-framed message from a channel.
pub(crate) async fn read_message(channel: &dyn CommChannel) -> Result<Vec<u8>> {
    let mut raw = [0u8; INNER_HEADER_SIZE];
    channel.read(&mut raw).await?;

    let header = framing::parse_inner(&raw)?;

    let mut message = vec![0u8; header.data_size as usize];
    channel.read(&mut message).await?;

    Ok(message)
}

/// Writes one message with its inner header as a single channel write, so
/// header and body land in the same outer frame.
pub(crate) async fn send_message(channel: &dyn CommChannel, message: Vec<u8>) -> Result<()> {
    let mut framed = Vec::with_capacity(INNER_HEADER_SIZE + message.len());
    framed.extend_from_slice(&framing::build_inner(message.len() as u32));
    framed.extend_from_slice(&message);

    channel.write(framed).await
}
