// SPDX-License-Identifier: Apache-2.0

//! Outer byte-stream transports.
//!
//! The mux is the only reader of a transport; writers are serialized above
//! this layer by the mux's frame lock. `connect` blocks until a peer is
//! available and may be called again after a loss to wait for the next one.

mod socket;
mod stream_pair;

pub use socket::SocketTransport;
pub use stream_pair::StreamPairTransport;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Blocks until the outer peer is connected. Idempotent while connected.
    async fn connect(&self) -> Result<()>;

    /// Fills `buf` exactly or fails.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` or fails.
    async fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Tears the transport down and wakes any blocked reader or writer.
    async fn close(&self) -> Result<()>;
}
