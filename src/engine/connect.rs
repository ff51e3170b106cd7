/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Establishing the framed connection the loop drives.
//!
//! The server can live behind a TCP endpoint or (on Unix platforms) a filesystem socket; either
//! way the loop sees one object that reads and writes whole `RespValue` frames.

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_sink::Sink;
use futures_util::stream::Stream;

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Framed};

use crate::{
    error::Error,
    protocol::{resp::RespValue, RespCodec},
};

/// Where the server lives.
#[derive(Debug, Clone)]
pub(crate) enum ServerAddr {
    Tcp(String, u16),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerAddr::Tcp(host, port) => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A connection that reads and writes RESP frames, over whichever transport was configured.
pub(crate) enum RespConnection {
    Tcp(Framed<TcpStream, RespCodec>),
    #[cfg(unix)]
    Unix(Framed<UnixStream, RespCodec>),
}

pub(crate) async fn connect(addr: &ServerAddr) -> Result<RespConnection, Error> {
    match addr {
        ServerAddr::Tcp(host, port) => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(RespConnection::Tcp(RespCodec.framed(stream)))
        }
        #[cfg(unix)]
        ServerAddr::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(RespConnection::Unix(RespCodec.framed(stream)))
        }
    }
}

impl Stream for RespConnection {
    type Item = Result<RespValue, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_next(cx),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_next(cx),
        }
    }
}

impl Sink<RespValue> for RespConnection {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_ready(cx).map_err(Error::from),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_ready(cx).map_err(Error::from),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: RespValue) -> Result<(), Self::Error> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).start_send(item).map_err(Error::from),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).start_send(item).map_err(Error::from),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_flush(cx).map_err(Error::from),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_flush(cx).map_err(Error::from),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_close(cx).map_err(Error::from),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_close(cx).map_err(Error::from),
        }
    }
}
