use tokio::io::{AsyncBufRead, AsyncReadExt};

/// Read one BDAT chunk of exactly `size` octets into `sink`
/// ([RFC 3030](https://datatracker.ietf.org/doc/html/rfc3030)).
///
/// Chunks are opaque octet runs; no dot-stuffing, no terminator. A short
/// read means the client hung up mid-chunk.
pub async fn read_chunk<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    size: u64,
    sink: &mut Vec<u8>,
) -> std::io::Result<()> {
    let n = reader.take(size).read_to_end(sink).await?;
    if (n as u64) < size {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Consume a refused chunk without buffering it, keeping the connection
/// in sync.
pub async fn discard_chunk<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    size: u64,
) -> std::io::Result<()> {
    let mut scratch = [0u8; 4096];
    let mut remaining = size;
    while remaining > 0 {
        let want = usize::try_from(remaining.min(scratch.len() as u64)).unwrap_or(scratch.len());
        let n = reader.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::read_chunk;

    #[tokio::test]
    async fn exact_chunks() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        client.write_all(b"first chunk.second").await?;
        client.shutdown().await?;

        let mut sink = Vec::new();
        read_chunk(&mut server, 12, &mut sink).await?;
        assert_eq!(sink, b"first chunk.");

        read_chunk(&mut server, 6, &mut sink).await?;
        assert_eq!(sink, b"first chunk.second");

        Ok(())
    }

    #[tokio::test]
    async fn discard_leaves_stream_in_sync() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(16384);
        let mut server = BufReader::new(server);

        client.write_all(&vec![b'x'; 10000]).await?;
        client.write_all(b"tail").await?;
        client.shutdown().await?;

        super::discard_chunk(&mut server, 10000).await?;

        let mut sink = Vec::new();
        read_chunk(&mut server, 4, &mut sink).await?;
        assert_eq!(sink, b"tail");

        Ok(())
    }

    #[tokio::test]
    async fn short_chunk_is_an_error() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        client.write_all(b"oops").await?;
        client.shutdown().await?;

        let mut sink = Vec::new();
        assert_eq!(
            read_chunk(&mut server, 64, &mut sink)
                .await
                .unwrap_err()
                .kind(),
            std::io::ErrorKind::UnexpectedEof
        );

        Ok(())
    }
}
