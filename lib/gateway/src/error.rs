// SPDX-License-Identifier: Apache-2.0

//! Gateway error taxonomy.
//!
//! Every fallible operation in this crate returns one of these kinds.
//! `Closed` is the normal outcome of shutdown and is never logged as a
//! failure by the pumps that receive it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The channel, queue or stream was closed under the caller.
    #[error("closed")]
    Closed,

    /// A bounded wait expired.
    #[error("timeout")]
    Timeout,

    /// Underlying I/O, TLS or protocol failure with a diagnostic message.
    #[error("{0}")]
    Runtime(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported")]
    NotSupported,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExist(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    /// Numeric code reported to the peer in failure replies.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Closed => 1,
            Error::Timeout => 2,
            Error::Runtime(_) => 3,
            Error::InvalidArgument(_) => 4,
            Error::NotSupported => 5,
            Error::NotFound(_) => 6,
            Error::AlreadyExist(_) => 7,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
                Error::Closed
            }
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Runtime(err.to_string()),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Runtime(format!("grpc: {status}"))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Runtime(format!("grpc transport: {err}"))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::InvalidArgument(format!("decode: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Runtime(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Runtime(format!("http: {err}"))
        }
    }
}
