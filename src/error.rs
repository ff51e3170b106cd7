/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error handling

use std::{error, fmt, io, sync::Arc};

use crate::protocol::resp::RespValue;

#[derive(Debug, Clone)]
pub enum Error {
    /// A non-specific internal error that prevented an operation from completing
    Internal(String),

    /// An IO error occurred
    IO(Arc<io::Error>),

    /// A RESP parsing/serialising error occurred
    RESP(String, Option<RespValue>),

    /// A remote error returned by the server
    Remote(String),

    /// Error creating a connection, or an error with a connection being used
    Connection(ConnectionReason),

    /// An unexpected error, in most cases a bug in the calling code or in this
    /// library itself
    Unexpected(String),

    /// The server closed the connection
    EndOfStream,
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn unexpected(msg: impl Into<String>) -> Error {
    Error::Unexpected(msg.into())
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(Arc::new(err))
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Internal(s) => write!(f, "{}", s),
            Error::IO(err) => write!(f, "IO error: {}", err),
            Error::RESP(s, resp) => write!(f, "{}: {:?}", s, resp),
            Error::Remote(s) => write!(f, "{}", s),
            Error::Connection(reason) => write!(f, "Connection error: {}", reason),
            Error::Unexpected(err) => write!(f, "Unexpected error: {}", err),
            Error::EndOfStream => write!(f, "End of stream"),
        }
    }
}

/// Details of a connection-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// An attempt to use a connection while it is in the "connecting" state, clients should try
    /// again
    Connecting,
    /// An attempt was made to use a connection that is no longer connected
    NotConnected,
    /// Connection failed
    ConnectionFailed,
    /// The connection is already established, a second attempt would discard its state
    Connected,
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionReason::Connecting => write!(f, "Connecting"),
            ConnectionReason::NotConnected => write!(f, "NotConnected"),
            ConnectionReason::ConnectionFailed => write!(f, "ConnectionFailed"),
            ConnectionReason::Connected => write!(f, "Connected"),
        }
    }
}
