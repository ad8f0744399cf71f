pub mod stream;

use stream::MaybeTls;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite,
    AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::trace;

pub async fn write<S: AsyncWrite + Unpin>(
    stream: &mut S,
    src: impl AsRef<[u8]>,
) -> std::io::Result<()> {
    let src = src.as_ref();
    trace!("write: {:?}", String::from_utf8_lossy(src));
    stream.write_all(src).await
}

pub async fn write_flush<S: AsyncWrite + Unpin>(
    stream: &mut S,
    src: impl AsRef<[u8]>,
) -> std::io::Result<()> {
    write(stream, src).await?;
    stream.flush().await
}

#[derive(Debug, thiserror::Error)]
pub enum ReadLineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("end of stream")]
    Eof,
    #[error("line longer than {0} octets")]
    TooLong(usize),
}

/// Read one CRLF-terminated line of at most `limit` octets (terminator
/// included) into `buf`, without the terminator.
///
/// Only CRLF ends a line; a lone CR or LF is kept verbatim. An overlong
/// line is consumed up to its CRLF and reported as [`ReadLineError::TooLong`]
/// so the caller can complain and stay in sync with the peer.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
    buf: &mut Vec<u8>,
) -> Result<(), ReadLineError> {
    debug_assert!(buf.is_empty(), "buffer must be empty");

    while buf.len() < limit {
        let remaining = (limit - buf.len()) as u64;
        if (&mut *reader).take(remaining).read_until(b'\n', buf).await? == 0 {
            return Err(ReadLineError::Eof);
        }

        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            trace!("read: {:?}", String::from_utf8_lossy(buf));
            return Ok(());
        }
    }

    drain_line(reader, buf.ends_with(b"\r")).await?;
    Err(ReadLineError::TooLong(limit))
}

/// Consume input up to and including the next CRLF. `split_cr` marks a CR
/// already consumed as the caller's last octet.
async fn drain_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    mut split_cr: bool,
) -> Result<(), ReadLineError> {
    let mut chunk = Vec::new();

    loop {
        chunk.clear();
        if (&mut *reader).take(1024).read_until(b'\n', &mut chunk).await? == 0 {
            return Err(ReadLineError::Eof);
        }

        // a take() boundary can fall between the CR and the LF
        if chunk.ends_with(b"\r\n") || (split_cr && chunk == b"\n") {
            return Ok(());
        }

        split_cr = chunk.ends_with(b"\r");
    }
}

/// Buffered connection that can be upgraded to TLS in place.
pub struct Connection<IO: AsyncRead + AsyncWrite + Unpin> {
    stream: BufReader<MaybeTls<IO>>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Connection<IO> {
    pub fn new(stream: impl Into<MaybeTls<IO>>) -> Self {
        Self {
            stream: BufReader::new(stream.into()),
        }
    }

    pub fn stream_mut(&mut self) -> &mut BufReader<MaybeTls<IO>> {
        &mut self.stream
    }

    pub async fn write(&mut self, src: impl AsRef<[u8]>) -> std::io::Result<()> {
        write(&mut self.stream, src).await
    }

    pub async fn write_flush(&mut self, src: impl AsRef<[u8]>) -> std::io::Result<()> {
        write_flush(&mut self.stream, src).await
    }

    /// Octets already read from the transport but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.stream.buffer().len()
    }

    /// Perform the TLS handshake on the underlying transport. The read
    /// buffer must be empty; pipelined cleartext across the upgrade is not
    /// supported.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> std::io::Result<()> {
        debug_assert!(self.stream.buffer().is_empty(), "buffer must be empty");
        self.stream.get_mut().upgrade(acceptor).await
    }

    pub fn is_plain(&self) -> bool {
        self.stream.get_ref().is_plain()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::{read_line, ReadLineError};

    #[tokio::test]
    async fn crlf_framing() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        client.write_all(b"NOOP\r\nlone\nfeed\r\nlast\r\n").await?;
        client.shutdown().await?;

        let mut buf = Vec::new();
        read_line(&mut server, 64, &mut buf).await.unwrap();
        assert_eq!(buf, b"NOOP");

        // a bare LF does not end the line
        buf.clear();
        read_line(&mut server, 64, &mut buf).await.unwrap();
        assert_eq!(buf, b"lone\nfeed");

        buf.clear();
        read_line(&mut server, 64, &mut buf).await.unwrap();
        assert_eq!(buf, b"last");

        buf.clear();
        assert!(matches!(
            read_line(&mut server, 64, &mut buf).await,
            Err(ReadLineError::Eof)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn overlong_line_is_drained() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(8192);
        let mut server = BufReader::new(server);

        let mut long = vec![b'x'; 5000];
        long.extend_from_slice(b"\r\nQUIT\r\n");
        client.write_all(&long).await?;
        client.shutdown().await?;

        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&mut server, 16, &mut buf).await,
            Err(ReadLineError::TooLong(16))
        ));

        // the next read starts at the following line
        buf.clear();
        read_line(&mut server, 16, &mut buf).await.unwrap();
        assert_eq!(buf, b"QUIT");

        Ok(())
    }

    #[tokio::test]
    async fn overflow_split_between_cr_and_lf() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        // the limit lands exactly between the CR and the LF
        client.write_all(b"1234567\r\nNEXT\r\n").await?;
        client.shutdown().await?;

        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&mut server, 8, &mut buf).await,
            Err(ReadLineError::TooLong(8))
        ));

        buf.clear();
        read_line(&mut server, 16, &mut buf).await.unwrap();
        assert_eq!(buf, b"NEXT");

        Ok(())
    }
}
