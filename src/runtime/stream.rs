use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{error::Result, options::ServerAddress, RUNTIME};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte stream bound to one server.
///
/// TLS is an external collaborator (§1): a deployment configured with `tls=true` negotiates a
/// TLS session before the handshake, but the details of that negotiation (cipher suites,
/// certificate validation, OCSP) live outside this crate. `AsyncStream` only distinguishes
/// "has this connection committed to a transport" from "is it a bare socket", which is all the
/// rest of the crate (wire codec, pool) needs to know.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    /// Used by tests to drive the connection state machine without a real socket.
    #[cfg(test)]
    Null,
}

impl AsyncStream {
    #[cfg(test)]
    pub(crate) fn null() -> Self {
        AsyncStream::Null
    }

    pub(crate) async fn connect(address: &ServerAddress, connect_timeout: Option<Duration>) -> Result<Self> {
        let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let connect = TcpStream::connect((address.host.as_str(), address.port()));
        let stream = RUNTIME.timeout(timeout, async { Ok(connect.await?) }).await?;
        stream.set_nodelay(true)?;
        Ok(AsyncStream::Tcp(stream))
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(test)]
            AsyncStream::Null => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(test)]
            AsyncStream::Null => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(test)]
            AsyncStream::Null => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(test)]
            AsyncStream::Null => Poll::Ready(Ok(())),
        }
    }
}
