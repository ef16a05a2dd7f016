// SPDX-License-Identifier: Apache-2.0

//! Outer-side communication: per-port channels, the mux that owns the single
//! byte-stream, and the TLS overlay for secure ports.

mod channel;
mod mux;
mod secure;

pub use channel::{Channel, ChannelStream};
pub use mux::CommManager;
pub use secure::SecureChannel;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Backoff between outer transport connect attempts.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a channel write waits for the transport to come up.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// One multiplexed sub-stream of the outer transport, plain or TLS-wrapped.
#[async_trait]
pub trait CommChannel: Send + Sync {
    /// Blocks until the channel is usable (transport up, TLS established).
    async fn connect(&self) -> Result<()>;

    /// Fills `buf` exactly; blocks until enough bytes arrive or the channel
    /// closes, in which case `Closed` is returned.
    async fn read(&self, buf: &mut [u8]) -> Result<()>;

    /// Writes one message through the channel.
    async fn write(&self, message: Vec<u8>) -> Result<()>;

    /// Marks the channel closed and wakes all waiters. Succeeds once.
    async fn close(&self) -> Result<()>;
}
