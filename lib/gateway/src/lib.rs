// SPDX-License-Identifier: Apache-2.0

//! Message-proxy gateway core.
//!
//! Bridges a single untrusted outer byte-stream with two trusted inner gRPC
//! services on the same host. The outer side terminates a checksummed framing
//! layer and multiplexes virtual ports over the one stream; selected ports
//! carry a mutual-TLS overlay. Each port is pumped to and from a dedicated
//! bidirectional gRPC stream on the inner side, with reconnect and
//! replay-on-reconnect caching. Secure CM traffic additionally drives an
//! asynchronous image download, unpack and chunked-delivery pipeline.
//!
//! Module map:
//! - [`framing`]: outer/inner headers and checksums
//! - [`comm`]: per-port channels, the outer mux, the TLS overlay
//! - [`transport`]: outer byte-stream variants (TCP server, stream pair)
//! - [`clients`]: inner gRPC streaming clients and the cert provider
//! - [`endpoints`]: the per-endpoint connection runners
//! - [`downloader`] and [`image`]: the image content pipeline

pub mod clients;
pub mod comm;
pub mod config;
pub mod downloader;
pub mod endpoints;
pub mod error;
pub mod framing;
pub mod image;
pub mod logging;
pub mod transport;

pub use error::{Error, Result};

/// Generated protocol bindings for the inner services.
pub mod proto {
    pub mod servicemanager {
        tonic::include_proto!("servicemanager.v4");
    }

    pub mod iamanager {
        tonic::include_proto!("iamanager.v5");
    }
}
