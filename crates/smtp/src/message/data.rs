use line::{read_line, ReadLineError};
use tokio::io::AsyncBufRead;

/// Result of consuming a DATA payload up to the terminating `.` line.
///
/// `content` is only meaningful when neither flag is set; the engine still
/// consumes the full payload on overflow so the error reply lands after
/// the terminator, with the connection in sync.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Payload {
    /// Dot-unstuffed payload, lines joined with CRLF, no trailing CRLF.
    pub content: Vec<u8>,
    /// Some line exceeded the line length limit.
    pub line_too_long: bool,
    /// The octet count (CRLFs included) exceeded the size limit.
    pub too_big: bool,
}

/// Read a DATA payload until the line consisting solely of `.`.
///
/// Each line has its leading dot unstuffed. Errors mean the transport
/// failed or closed mid-payload; the caller must drop the connection
/// without replying.
pub async fn read_data<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line_limit: usize,
    size_limit: usize,
) -> Result<Payload, ReadLineError> {
    let mut payload = Payload::default();
    let mut line = Vec::new();
    let mut octets = 0usize;
    let mut first = true;

    loop {
        line.clear();
        match read_line(reader, line_limit, &mut line).await {
            Ok(()) => {}
            Err(ReadLineError::TooLong(_)) => {
                payload.line_too_long = true;
                payload.content.clear();
                continue;
            }
            Err(e) => return Err(e),
        }

        if line == b"." {
            return Ok(payload);
        }

        octets += line.len() + 2;
        if octets > size_limit {
            payload.too_big = true;
            payload.content.clear();
        }
        if payload.too_big || payload.line_too_long {
            continue;
        }

        let unstuffed = line.strip_prefix(b".").unwrap_or(&line);
        if !first {
            payload.content.extend_from_slice(b"\r\n");
        }
        payload.content.extend_from_slice(unstuffed);
        first = false;
    }
}

/// Re-apply dot-stuffing and the terminator; the inverse of [`read_data`].
#[cfg(test)]
fn stuff(content: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    for line in content.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            wire.push(b'.');
        }
        wire.extend_from_slice(line);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b".\r\n");
    wire
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::{read_data, stuff, Payload};

    async fn collect(wire: &[u8], line_limit: usize, size_limit: usize) -> Payload {
        let (mut client, server) = tokio::io::duplex(8192);
        let mut server = BufReader::new(server);

        client.write_all(wire).await.unwrap();
        client.shutdown().await.unwrap();

        read_data(&mut server, line_limit, size_limit).await.unwrap()
    }

    #[tokio::test]
    async fn joins_lines_with_crlf() {
        let payload = collect(b"Dear recipient,\r\n\r\nyes.\r\n.\r\n", 1001, 1024).await;
        assert_eq!(payload.content, b"Dear recipient,\r\n\r\nyes.");
        assert!(!payload.line_too_long);
        assert!(!payload.too_big);
    }

    #[tokio::test]
    async fn unstuffs_leading_dots() {
        let payload = collect(b"..line\r\n...\r\n.\r\n", 1001, 1024).await;
        assert_eq!(payload.content, b".line\r\n..");
    }

    #[tokio::test]
    async fn empty_payload() {
        let payload = collect(b".\r\n", 1001, 1024).await;
        assert_eq!(payload.content, b"");
    }

    #[tokio::test]
    async fn size_limit_consumes_to_terminator() {
        let payload = collect(b"01234567890123456789\r\n.\r\n", 1001, 10).await;
        assert!(payload.too_big);
        assert!(payload.content.is_empty());
    }

    #[tokio::test]
    async fn line_limit_consumes_to_terminator() {
        let mut wire = vec![b'x'; 64];
        wire.extend_from_slice(b"\r\nshort\r\n.\r\n");
        let payload = collect(&wire, 16, 1024).await;
        assert!(payload.line_too_long);
    }

    #[tokio::test]
    async fn round_trip() {
        let wire = b"plain\r\n..stuffed\r\n\r\n...twice\r\n.\r\n";
        let payload = collect(wire, 1001, 1024).await;
        assert_eq!(payload.content, b"plain\r\n.stuffed\r\n\r\n..twice");
        assert_eq!(stuff(&payload.content), wire);
    }

    #[tokio::test]
    async fn aborts_on_eof_before_terminator() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        client.write_all(b"no terminator\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(read_data(&mut server, 1001, 1024).await.is_err());
    }
}
