// SPDX-License-Identifier: Apache-2.0

//! Tracing setup for the daemon.
//!
//! The default filter quiets the HTTP/gRPC plumbing crates; `PORTGATE_LOG`
//! overrides everything, otherwise the CLI verbosity level is used.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to override the log filter.
const FILTER_ENV: &str = "PORTGATE_LOG";

static INIT: Once = Once::new();

/// Initializes the global subscriber once; later calls are no-ops.
///
/// `json` switches to line-oriented JSON output for journal collection.
pub fn init(level: &str, json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{level},h2=error,tower=error,hyper_util=error,rustls=error,tonic=error"
            ))
        });

        if json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
