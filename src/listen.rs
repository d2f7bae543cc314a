//! Listeners and streams that are either TCP or unix sockets.
//!
//! An address ending in `.sock` is a unix socket path, anything else is a
//! TCP address. Servers and clients share this convention so the same
//! configuration value works for both transports.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::Router;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

pub fn is_unix_addr(addr: &str) -> bool {
    addr.ends_with(".sock")
}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        if is_unix_addr(addr) {
            // A socket file left behind by a previous run would fail the bind.
            if tokio::fs::metadata(addr).await.is_ok() {
                tokio::fs::remove_file(addr).await?;
            }
            Ok(Self::Unix(UnixListener::bind(addr)?))
        } else {
            Ok(Self::Tcp(TcpListener::bind(addr).await?))
        }
    }

    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The bound TCP address, if this is a TCP listener. Used by tests that
    /// bind port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

pub async fn connect(addr: &str) -> io::Result<Stream> {
    if is_unix_addr(addr) {
        Ok(Stream::Unix(UnixStream::connect(addr).await?))
    } else {
        Ok(Stream::Tcp(TcpStream::connect(addr).await?))
    }
}

pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Serves an axum router on a TCP or unix listener until the token cancels.
pub async fn serve(listener: Listener, router: Router, cancel: CancellationToken) -> io::Result<()> {
    match listener {
        Listener::Tcp(listener) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
        Listener::Unix(listener) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_classification() {
        assert!(is_unix_addr("/run/dockhand/proxy.sock"));
        assert!(is_unix_addr("event.sock"));
        assert!(!is_unix_addr("0.0.0.0:2020"));
        assert!(!is_unix_addr("localhost:8080"));
    }

    #[tokio::test]
    async fn tcp_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect(&addr.to_string()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }
}
