//! Stream abstraction over plain TCP and TLS connections.
//!
//! TLS support is feature-gated; when enabled, acceptors and connectors are
//! supplied pre-built by the embedder. Certificate material never touches
//! this crate.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use rustls::pki_types::ServerName;

/// One established byte stream, optionally TLS-wrapped.
pub enum NetStream {
    /// Plain TCP connection.
    Tcp(TcpStream),
    /// TLS-encrypted connection, client or server side.
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl NetStream {
    pub fn is_tls(&self) -> bool {
        match self {
            NetStream::Tcp(_) => false,
            #[cfg(feature = "tls")]
            NetStream::Tls(_) => true,
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Server-side stream wrapping applied to every accepted connection.
#[derive(Clone, Default)]
pub enum StreamAcceptor {
    /// Plain TCP, no wrapping.
    #[default]
    Plain,
    /// Wrap accepted streams with a pre-built TLS acceptor.
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::TlsAcceptor),
}

impl StreamAcceptor {
    pub async fn accept(&self, stream: TcpStream) -> std::io::Result<NetStream> {
        match self {
            StreamAcceptor::Plain => Ok(NetStream::Tcp(stream)),
            #[cfg(feature = "tls")]
            StreamAcceptor::Tls(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(NetStream::Tls(Box::new(tls.into())))
            }
        }
    }
}

/// Client-side stream wrapping applied to every outbound connection.
#[derive(Clone, Default)]
pub enum StreamConnector {
    /// Plain TCP, no wrapping.
    #[default]
    Plain,
    /// Wrap outbound streams with a pre-built TLS connector.
    #[cfg(feature = "tls")]
    Tls {
        connector: tokio_rustls::TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl StreamConnector {
    pub async fn wrap(&self, stream: TcpStream) -> std::io::Result<NetStream> {
        match self {
            StreamConnector::Plain => Ok(NetStream::Tcp(stream)),
            #[cfg(feature = "tls")]
            StreamConnector::Tls {
                connector,
                server_name,
            } => {
                let tls = connector.connect(server_name.clone(), stream).await?;
                Ok(NetStream::Tls(Box::new(tls.into())))
            }
        }
    }
}
