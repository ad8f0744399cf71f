use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;

pub use tokio_rustls::server::TlsStream;

enum Inner<IO> {
    Plain(IO),
    Tls(TlsStream<IO>),
    Empty,
}

/// A server-side stream that may or may not be encrypted yet.
///
/// This is the transport under STARTTLS: the session starts in cleartext
/// and [`MaybeTls::upgrade`] replaces the read/write pair in place once the
/// handshake completes.
pub struct MaybeTls<IO> {
    inner: Inner<IO>,
}

impl<IO> From<IO> for MaybeTls<IO> {
    fn from(plain: IO) -> Self {
        Self::from_plain(plain)
    }
}

impl<IO> MaybeTls<IO> {
    pub const fn from_plain(plain: IO) -> Self {
        Self {
            inner: Inner::Plain(plain),
        }
    }

    pub const fn from_tls(tls: TlsStream<IO>) -> Self {
        Self {
            inner: Inner::Tls(tls),
        }
    }

    pub const fn is_plain(&self) -> bool {
        matches!(self.inner, Inner::Plain(_))
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> MaybeTls<IO> {
    /// Upgrade the stream to TLS.
    ///
    /// A no-op if the stream is already encrypted.
    ///
    /// # Errors
    ///
    /// If the handshake fails, the error is returned and the stream is
    /// reverted to plaintext.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> std::io::Result<()> {
        let (inner, result) = match std::mem::replace(&mut self.inner, Inner::Empty) {
            Inner::Plain(plain) => match acceptor.accept(plain).into_fallible().await {
                Ok(tls) => (Inner::Tls(tls), Ok(())),
                Err((err, plain)) => (Inner::Plain(plain), Err(err)),
            },
            Inner::Tls(tls) => (Inner::Tls(tls), Ok(())),
            Inner::Empty => unreachable!(),
        };
        self.inner = inner;
        result
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTls<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.inner {
            Inner::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Inner::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Inner::Empty => unreachable!(),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTls<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut self.inner {
            Inner::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Inner::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            Inner::Empty => unreachable!(),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.inner {
            Inner::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Inner::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Inner::Empty => unreachable!(),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut self.inner {
            Inner::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Inner::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Inner::Empty => unreachable!(),
        }
    }
}
