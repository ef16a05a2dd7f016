// SPDX-License-Identifier: Apache-2.0

//! Inner-side gRPC streaming clients and the certificate provider.
//!
//! Each client keeps one bidirectional stream toward its service, reconnects
//! with a bounded backoff, and replays its reconnect cache in FIFO order
//! before any newly queued message whenever a stream comes up.

pub mod cert;
pub mod cm;
pub mod iam;

pub use cm::CmClient;
pub use iam::{IamClient, NodeClient};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Backoff between inner stream attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Bound of the reconnect cache; the oldest entry is dropped on overflow.
pub const CACHE_CAPACITY: usize = 16;

/// Depth of the buffered request stream toward an inner service.
pub(crate) const STREAM_BUFFER: usize = 32;

/// Contract between an endpoint runner and its inner client.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The outer side of this endpoint came up.
    async fn on_connected(&self);

    /// The outer side is going away; the client shuts down.
    async fn on_disconnected(&self);

    /// Queues one serialized message for the inner service.
    async fn send(&self, message: Vec<u8>) -> Result<()>;

    /// Blocks until the inner service produced a message, or `Closed`.
    async fn receive(&self) -> Result<Vec<u8>>;
}
